//! Read parameters: ordering, relational expansion and equality filters.
//!
//! They are rendered as PostgREST query parameters
//! (`select=*,expense_categories(*)`, `order=expense_date.desc`,
//! `status=eq.pending`).

use std::fmt::Display;

use api_types::Collection;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Ascending => "asc",
            Self::Descending => "desc",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    order: Vec<Order>,
    expand: Vec<Collection>,
    filters: Vec<(String, String)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Newest expenses first with their category and user inlined, matching
    /// the standing order of an expense snapshot.
    pub fn expenses() -> Self {
        Self::new()
            .order_by("expense_date", Direction::Descending)
            .order_by("id", Direction::Ascending)
            .expand(Collection::ExpenseCategories)
            .expand(Collection::Users)
    }

    /// Adds a sort key; keys apply in the order they are added.
    pub fn order_by(mut self, column: &str, direction: Direction) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            direction,
        });
        self
    }

    /// Inlines the referenced rows of `relation` into each result row.
    pub fn expand(mut self, relation: Collection) -> Self {
        if !self.expand.contains(&relation) {
            self.expand.push(relation);
        }
        self
    }

    pub fn eq(mut self, column: &str, value: impl Display) -> Self {
        self.filters.push((column.to_string(), format!("eq.{value}")));
        self
    }

    pub fn expansions(&self) -> impl Iterator<Item = Collection> + '_ {
        self.expand.iter().copied()
    }

    pub(crate) fn select(&self) -> String {
        let mut select = String::from("*");
        for relation in &self.expand {
            select.push(',');
            select.push_str(relation.as_str());
            select.push_str("(*)");
        }
        select
    }

    pub(crate) fn params(&self) -> Vec<(String, String)> {
        let mut params = vec![("select".to_string(), self.select())];
        if !self.order.is_empty() {
            let order = self
                .order
                .iter()
                .map(|order| format!("{}.{}", order.column, order.direction.as_str()))
                .collect::<Vec<_>>()
                .join(",");
            params.push(("order".to_string(), order));
        }
        params.extend(self.filters.iter().cloned());
        params
    }
}
