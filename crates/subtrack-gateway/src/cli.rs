use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use serde::Serialize;
use subtrack_core::types::{
    Category, Currency, Frequency, SubscriptionId, UserId, UserRole, WorkflowHandle,
};
use subtrack_subscriptions::{NewSubscription, SubscriptionFields};
use subtrack_users::NewUser;

use crate::app::AppState;

#[derive(Parser)]
#[command(name = "subtrack")]
#[command(about = "Subscription tracker with renewal reminders", version)]
pub struct Cli {
    /// Config file (defaults to $SUBTRACK_CONFIG, then ~/.subtrack/subtrack.toml)
    #[arg(long, global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduler engine and the admin HTTP API (the default)
    Serve,
    /// Manage user accounts
    #[command(subcommand)]
    Users(UserCommand),
    /// Manage subscriptions
    #[command(subcommand)]
    Subscriptions(SubscriptionCommand),
    /// Inspect and stop workflow instances
    #[command(subcommand)]
    Workflows(WorkflowCommand),
}

#[derive(Subcommand)]
pub enum UserCommand {
    /// Register a user
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        admin: bool,
    },
    /// List users
    List,
    /// Check a user's email and password
    Verify {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Rename a user
    Rename {
        id: String,
        #[arg(long)]
        name: String,
    },
    /// Delete a user
    Remove { id: String },
}

#[derive(Subcommand)]
pub enum SubscriptionCommand {
    /// Create a subscription and arm its reminders
    Add {
        /// Owner's email address
        #[arg(long)]
        owner: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        price: f64,
        #[arg(long, default_value = "USD")]
        currency: Currency,
        /// daily, weekly, monthly or yearly
        #[arg(long)]
        frequency: Frequency,
        #[arg(long, default_value = "others")]
        category: Category,
        #[arg(long)]
        payment_method: String,
        /// YYYY-MM-DD, not in the future
        #[arg(long)]
        start_date: NaiveDate,
    },
    /// List subscriptions, optionally for one owner
    List {
        #[arg(long)]
        owner: Option<String>,
    },
    /// Show one subscription
    Show { id: String },
    /// Active subscriptions of an owner renewing in the next 30 days
    Upcoming {
        #[arg(long)]
        owner: String,
    },
    /// Patch an active subscription
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        price: Option<f64>,
        #[arg(long)]
        currency: Option<Currency>,
        #[arg(long)]
        frequency: Option<Frequency>,
        #[arg(long)]
        category: Option<Category>,
        #[arg(long)]
        payment_method: Option<String>,
        #[arg(long)]
        start_date: Option<NaiveDate>,
    },
    /// Cancel an active subscription
    Cancel { id: String },
    /// Mark a subscription inactive and clear its renewal date
    Unsubscribe { id: String },
    /// Reactivate a cancelled subscription from a new start date
    Resume {
        id: String,
        #[arg(long)]
        start_date: NaiveDate,
    },
    /// Delete a subscription
    Delete { id: String },
}

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Pending, running and sleeping instances
    Running,
    /// Instances that ended in failure
    Failed,
    /// Reminders that could not be delivered
    Undelivered,
    /// One instance
    Status { handle: String },
    /// The step journal of one instance
    Steps { handle: String },
    /// Stop one instance
    Cancel { handle: String },
    /// Stop every live instance
    CancelAll,
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn owner_id(state: &AppState, email: &str) -> Result<UserId> {
    let user = state
        .users
        .find_by_email(email)?
        .with_context(|| format!("no user with email {email}"))?;
    Ok(user.id)
}

pub fn run_users(state: &AppState, cmd: UserCommand) -> Result<()> {
    match cmd {
        UserCommand::Add {
            name,
            email,
            password,
            admin,
        } => {
            let role = if admin { UserRole::Admin } else { UserRole::User };
            let user = state.users.register(&NewUser {
                name,
                email,
                password,
                role,
            })?;
            print_json(&user)
        }
        UserCommand::List => print_json(&state.users.list()?),
        UserCommand::Verify { email, password } => {
            print_json(&state.users.authenticate(&email, &password)?)
        }
        UserCommand::Rename { id, name } => {
            print_json(&state.users.rename(&UserId::from(id), &name)?)
        }
        UserCommand::Remove { id } => {
            state.users.remove(&UserId::from(id.as_str()))?;
            println!("removed user {id}");
            Ok(())
        }
    }
}

pub async fn run_subscriptions(state: &AppState, cmd: SubscriptionCommand) -> Result<()> {
    let tracker = &state.tracker;
    match cmd {
        SubscriptionCommand::Add {
            owner,
            name,
            price,
            currency,
            frequency,
            category,
            payment_method,
            start_date,
        } => {
            let new = NewSubscription {
                name,
                price,
                currency,
                frequency,
                category,
                payment_method,
                start_date,
                owner: owner_id(state, &owner)?,
            };
            print_json(&tracker.create(&new).await?)
        }
        SubscriptionCommand::List { owner } => match owner {
            Some(email) => print_json(&tracker.list_for_owner(&owner_id(state, &email)?)?),
            None => print_json(&tracker.list_all()?),
        },
        SubscriptionCommand::Show { id } => {
            let sub = tracker
                .get(&SubscriptionId::from(id.as_str()))?
                .with_context(|| format!("subscription {id} not found"))?;
            print_json(&sub)
        }
        SubscriptionCommand::Upcoming { owner } => {
            print_json(&tracker.upcoming_renewals(&owner_id(state, &owner)?)?)
        }
        SubscriptionCommand::Update {
            id,
            name,
            price,
            currency,
            frequency,
            category,
            payment_method,
            start_date,
        } => {
            let patch = SubscriptionFields {
                name,
                price,
                currency,
                frequency,
                category,
                payment_method,
                status: None,
                start_date,
                renewal_date: None,
            };
            if patch.is_empty() {
                bail!("nothing to update; pass at least one field flag");
            }
            print_json(&tracker.update(&SubscriptionId::from(id), &patch).await?)
        }
        SubscriptionCommand::Cancel { id } => {
            print_json(&tracker.cancel(&SubscriptionId::from(id)).await?)
        }
        SubscriptionCommand::Unsubscribe { id } => {
            print_json(&tracker.unsubscribe(&SubscriptionId::from(id)).await?)
        }
        SubscriptionCommand::Resume { id, start_date } => {
            print_json(&tracker.resume(&SubscriptionId::from(id), start_date).await?)
        }
        SubscriptionCommand::Delete { id } => {
            tracker.delete(&SubscriptionId::from(id.as_str())).await?;
            println!("deleted subscription {id}");
            Ok(())
        }
    }
}

pub fn run_workflows(state: &AppState, cmd: WorkflowCommand) -> Result<()> {
    let admin = &state.admin;
    match cmd {
        WorkflowCommand::Running => print_json(&admin.running()?),
        WorkflowCommand::Failed => print_json(&admin.failed()?),
        WorkflowCommand::Undelivered => print_json(&admin.undelivered()?),
        WorkflowCommand::Status { handle } => print_json(&admin.status(&WorkflowHandle::from(handle))?),
        WorkflowCommand::Steps { handle } => print_json(&admin.steps(&WorkflowHandle::from(handle))?),
        WorkflowCommand::Cancel { handle } => print_json(&admin.cancel(&WorkflowHandle::from(handle))?),
        WorkflowCommand::CancelAll => print_json(&admin.cancel_all()?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_subscription_add() {
        let cli = Cli::try_parse_from([
            "subtrack",
            "subscriptions",
            "add",
            "--owner",
            "ada@example.com",
            "--name",
            "Netflix",
            "--price",
            "15.99",
            "--frequency",
            "monthly",
            "--payment-method",
            "Visa",
            "--start-date",
            "2025-01-01",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Subscriptions(SubscriptionCommand::Add {
                frequency,
                currency,
                start_date,
                ..
            })) => {
                assert_eq!(frequency, Frequency::Monthly);
                assert_eq!(currency, Currency::Usd);
                assert_eq!(start_date, NaiveDate::from_ymd_opt(2025, 1, 1).unwrap());
            }
            _ => panic!("expected subscriptions add"),
        }
    }

    #[test]
    fn rejects_unknown_frequency() {
        let res = Cli::try_parse_from([
            "subtrack",
            "subscriptions",
            "add",
            "--owner",
            "a@b.c",
            "--name",
            "X",
            "--price",
            "1",
            "--frequency",
            "hourly",
            "--payment-method",
            "Visa",
            "--start-date",
            "2025-01-01",
        ]);
        assert!(res.is_err());
    }

    #[test]
    fn parses_workflow_inspection_commands() {
        let cli = Cli::try_parse_from(["subtrack", "workflows", "steps", "wfr_1"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Workflows(WorkflowCommand::Steps { ref handle })) if handle == "wfr_1"
        ));
        let cli = Cli::try_parse_from(["subtrack", "workflows", "undelivered"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Command::Workflows(WorkflowCommand::Undelivered))
        ));
    }

    #[test]
    fn parses_users_verify() {
        let cli = Cli::try_parse_from([
            "subtrack",
            "users",
            "verify",
            "--email",
            "ada@example.com",
            "--password",
            "hunter22",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Users(UserCommand::Verify { email, password })) => {
                assert_eq!(email, "ada@example.com");
                assert_eq!(password, "hunter22");
            }
            _ => panic!("expected users verify"),
        }
    }
}
