use std::io::Write;

use api_types::{
    category::Category,
    expense::{Expense, ExpenseNew, ExpensePatch},
};
use data_access::{
    ClientHandle, Direction, Query, Reconciler, SubscriptionError, SubscriptionEvent,
    SubscriptionState,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{
    error::{AppError, Result},
    settings::{AddArgs, Command, UpdateArgs},
};

pub async fn run(client: &ClientHandle, command: Command) -> Result<()> {
    match command {
        Command::List { status } => {
            let mut query = Query::expenses();
            if let Some(status) = status {
                query = query.eq("status", status.as_str());
            }
            let expenses = client.expenses().fetch_all(&query).await?;
            print_expenses(&mut std::io::stdout().lock(), &expenses)?;
        }
        Command::Add(args) => {
            let created = client.expenses().create(&draft(client, args)?).await?;
            info!(id = %created.id, "expense recorded");
            print_expenses(&mut std::io::stdout().lock(), &[created])?;
        }
        Command::Update(args) => {
            let id = args.id;
            let patch = patch(args)?;
            let updated = client.expenses().update(id, &patch).await?;
            print_expenses(&mut std::io::stdout().lock(), &[updated])?;
        }
        Command::Delete { id } => {
            client.expenses().delete(id).await?;
            info!(%id, "expense deleted");
        }
        Command::Watch => watch(client).await?,
        Command::Categories => {
            let categories = client
                .categories()
                .fetch_all(&Query::new().order_by("name", Direction::Ascending))
                .await?;
            print_categories(&mut std::io::stdout().lock(), &categories)?;
        }
    }
    Ok(())
}

fn draft(client: &ClientHandle, args: AddArgs) -> Result<ExpenseNew> {
    let user_id = match args.user {
        Some(user) => user,
        None => client.require_session()?.user.id,
    };
    Ok(ExpenseNew {
        amount: Some(args.amount),
        category_id: Some(args.category),
        description: args.description,
        expense_date: Some(
            args.date
                .unwrap_or_else(|| chrono::Local::now().date_naive()),
        ),
        organization_id: Some(args.organization),
        user_id: Some(user_id),
    })
}

fn patch(args: UpdateArgs) -> Result<ExpensePatch> {
    let patch = ExpensePatch {
        amount: args.amount,
        category_id: args.category,
        description: args.description,
        expense_date: args.date,
        status: args.status,
    };
    if patch.is_empty() {
        return Err(AppError::Input("nothing to update".to_string()));
    }
    Ok(patch)
}

enum Signal {
    Changed,
    Failed(SubscriptionError),
    Closed,
}

async fn watch(client: &ClientHandle) -> Result<()> {
    let reconciler = Reconciler::<Expense>::new();
    let (signals, mut received) = mpsc::unbounded_channel();

    let handle = {
        let reconciler = reconciler.clone();
        client
            .subscriptions()
            .subscribe::<Expense, _>(move |event| {
                let signal = match &event {
                    SubscriptionEvent::Change(_) => Some(Signal::Changed),
                    SubscriptionEvent::Error(err @ SubscriptionError::Exhausted { .. }) => {
                        Some(Signal::Failed(err.clone()))
                    }
                    SubscriptionEvent::Error(err) => {
                        warn!("live updates: {err}");
                        None
                    }
                    SubscriptionEvent::Status(SubscriptionState::Closed) => Some(Signal::Closed),
                    SubscriptionEvent::Status(state) => {
                        info!(?state, "live updates");
                        None
                    }
                };
                reconciler.apply_subscription_event(event);
                if let Some(signal) = signal {
                    let _ = signals.send(signal);
                }
            })
    };

    let outcome: Result<()> = async {
        let snapshot = reconciler
            .refresh(&client.expenses(), &Query::expenses())
            .await?;
        print_expenses(&mut std::io::stdout().lock(), &snapshot)?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => return Ok(()),
                signal = received.recv() => match signal {
                    Some(Signal::Changed) => {
                        let mut out = std::io::stdout().lock();
                        writeln!(out)?;
                        print_expenses(&mut out, &reconciler.view())?;
                    }
                    Some(Signal::Failed(err)) => return Err(AppError::from(err)),
                    Some(Signal::Closed) | None => return Ok(()),
                },
            }
        }
    }
    .await;

    handle.cancel();
    outcome
}

fn print_expenses(out: &mut impl Write, expenses: &[Expense]) -> std::io::Result<()> {
    if expenses.is_empty() {
        return writeln!(out, "no expenses");
    }
    for expense in expenses {
        let category = expense
            .category
            .as_ref()
            .map(|category| category.name.clone())
            .unwrap_or_else(|| expense.category_id.to_string());
        writeln!(
            out,
            "{}  {:>10}  {:<8}  {:<20}  {}  {}",
            expense.expense_date,
            expense.amount.round_dp(2),
            expense.status.as_str(),
            category,
            expense.description.as_deref().unwrap_or("-"),
            expense.id,
        )?;
    }
    Ok(())
}

fn print_categories(out: &mut impl Write, categories: &[Category]) -> std::io::Result<()> {
    for category in categories {
        writeln!(out, "{}  {}", category.id, category.name)?;
    }
    Ok(())
}
