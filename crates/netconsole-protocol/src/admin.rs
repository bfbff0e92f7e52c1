//! Built-in `admin` commands.
//!
//! Each command is a short guided dialog. The current step lives in the
//! authenticated session state, so every step is its own transaction.
//! Passwords are always collected through the credential dialog, and a
//! pending new password is kept only as a hash.

use netconsole_core::Credentials;
use netconsole_store::{NewUser, StoreError, UserId, hash_password, verify_password};
use serde::{Deserialize, Serialize};

use crate::transaction::{ProtocolError, Transaction};

/// Longest accepted user or variable name.
const MAX_NAME_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum UserAction {
    List,
    Demote,
    Promote,
    Rename,
    Reset,
    Drop,
    Add,
}

impl UserAction {
    fn parse(word: &str) -> Option<Self> {
        const ACTIONS: [(&str, UserAction); 7] = [
            ("list", UserAction::List),
            ("demote", UserAction::Demote),
            ("promote", UserAction::Promote),
            ("rename", UserAction::Rename),
            ("reset", UserAction::Reset),
            ("drop", UserAction::Drop),
            ("add", UserAction::Add),
        ];
        ACTIONS
            .iter()
            .find(|(name, _)| word.eq_ignore_ascii_case(name))
            .map(|(_, action)| *action)
    }

    const fn takes_name(self) -> bool {
        !matches!(self, Self::List | Self::Add)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum VarAction {
    List,
    Set,
    Drop,
}

impl VarAction {
    fn parse(word: &str) -> Option<Self> {
        if word.eq_ignore_ascii_case("list") {
            Some(Self::List)
        } else if word.eq_ignore_ascii_case("set") {
            Some(Self::Set)
        } else if word.eq_ignore_ascii_case("drop") {
            Some(Self::Drop)
        } else {
            None
        }
    }
}

/// A recognised `admin` command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AdminCommand {
    SetPass,
    User(UserAction, Option<String>),
    Var(VarAction, Option<String>),
}

/// Recognise `admin <subcommand> [name]`, ignoring case and extra spacing.
///
/// Anything else, including unknown subcommands, is left to the application.
pub(crate) fn parse(text: &str) -> Option<AdminCommand> {
    let words: Vec<&str> = text.split_whitespace().collect();
    let (first, rest) = words.split_first()?;
    if !first.eq_ignore_ascii_case("admin") {
        return None;
    }
    match rest {
        [sub] if sub.eq_ignore_ascii_case("setpass") => Some(AdminCommand::SetPass),
        [group, action, arg @ ..] if arg.len() <= 1 => {
            let arg = arg.first().map(|s| (*s).to_string());
            if group.eq_ignore_ascii_case("user") {
                let action = UserAction::parse(action)?;
                (action.takes_name() || arg.is_none()).then_some(AdminCommand::User(action, arg))
            } else if group.eq_ignore_ascii_case("var") {
                let action = VarAction::parse(action)?;
                (action != VarAction::List || arg.is_none())
                    .then_some(AdminCommand::Var(action, arg))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Current step of a running admin dialog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub(crate) enum Wizard {
    SetPassCurrent,
    SetPassNew,
    SetPassConfirm { hash: String },
    UserAddCredentials,
    UserAddAdmin { name: String, hash: String },
    UserName { action: UserAction },
    UserRename { id: UserId, name: String },
    UserReset { id: UserId, name: String },
    UserDrop { id: UserId, name: String },
    VarName { action: VarAction },
    VarValue { name: String },
}

impl Wizard {
    const fn needs_admin(&self) -> bool {
        !matches!(
            self,
            Self::SetPassCurrent | Self::SetPassNew | Self::SetPassConfirm { .. }
        )
    }
}

/// User input for a dialog step.
pub(crate) enum StepInput {
    Message(String),
    Credential(Credentials),
    Cancel,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && !name.chars().any(|c| c.is_whitespace() || c.is_control())
}

/// Start `command` in `tx`.
pub(crate) async fn start(tx: &mut Transaction, command: AdminCommand) -> Result<(), ProtocolError> {
    let is_admin = tx.user().is_admin;
    tracing::info!(user = %tx.user().name, ?command, "admin command");

    match command {
        AdminCommand::SetPass => {
            tx.say("Confirm your current credentials.");
            ask(tx, "current password", Wizard::SetPassCurrent);
            Ok(())
        }
        _ if !is_admin => {
            tx.say("Permission denied: administrator rights required.");
            Ok(())
        }
        AdminCommand::User(UserAction::List, _) => list_users(tx).await,
        AdminCommand::User(UserAction::Add, _) => {
            ask(tx, "new user", Wizard::UserAddCredentials);
            Ok(())
        }
        AdminCommand::User(action, Some(name)) => pick_user(tx, action, &name).await,
        AdminCommand::User(action, None) => {
            prompt(tx, "User name:", Wizard::UserName { action });
            Ok(())
        }
        AdminCommand::Var(VarAction::List, _) => list_vars(tx).await,
        AdminCommand::Var(action, Some(name)) => pick_var(tx, action, &name).await,
        AdminCommand::Var(action, None) => {
            prompt(tx, "Variable name:", Wizard::VarName { action });
            Ok(())
        }
    }
}

/// Feed `input` to the dialog step `wizard`.
pub(crate) async fn step(
    tx: &mut Transaction,
    wizard: Wizard,
    input: StepInput,
) -> Result<(), ProtocolError> {
    if wizard.needs_admin() && !tx.user().is_admin {
        tx.say("Permission denied: administrator rights required.");
        return Ok(());
    }

    match (wizard, input) {
        (_, StepInput::Cancel) => {
            tx.say("Cancelled.");
            Ok(())
        }
        (_, StepInput::Message(text)) if text.trim().is_empty() => {
            tx.say("Cancelled.");
            Ok(())
        }

        (Wizard::SetPassCurrent, StepInput::Credential(c)) => {
            let me = tx.user();
            if c.user != me.name || !verify_password(&c.password, &me.password_hash)? {
                tx.say("Password not changed: credentials did not match.");
                return Ok(());
            }
            ask(tx, "new password", Wizard::SetPassNew);
            Ok(())
        }
        (Wizard::SetPassNew, StepInput::Credential(c)) => {
            if c.password.is_empty() {
                tx.say("Password not changed: empty password.");
                return Ok(());
            }
            let hash = hash_password(&c.password)?;
            ask(tx, "confirm new password", Wizard::SetPassConfirm { hash });
            Ok(())
        }
        (Wizard::SetPassConfirm { hash }, StepInput::Credential(c)) => {
            if !verify_password(&c.password, &hash)? {
                tx.say("Password not changed: passwords did not match.");
                return Ok(());
            }
            let mut me = tx.user().clone();
            me.password_hash = hash;
            tx.store().await?.update_user(&me).await?;
            tx.say("Password changed.");
            Ok(())
        }

        (Wizard::UserAddCredentials, StepInput::Credential(c)) => {
            if !valid_name(&c.user) {
                tx.say(format!("Invalid user name: {:?}.", c.user));
                return Ok(());
            }
            if c.password.is_empty() {
                tx.say("User not added: empty password.");
                return Ok(());
            }
            if tx.store().await?.user_by_name(&c.user).await?.is_some() {
                tx.say(format!("User {} already exists.", c.user));
                return Ok(());
            }
            let hash = hash_password(&c.password)?;
            prompt(
                tx,
                &format!("Grant administrator rights to {}? (yes/no)", c.user),
                Wizard::UserAddAdmin { name: c.user, hash },
            );
            Ok(())
        }
        (Wizard::UserAddAdmin { name, hash }, StepInput::Message(answer)) => {
            let is_admin = match answer.trim().to_ascii_lowercase().as_str() {
                "yes" | "y" => true,
                "no" | "n" => false,
                _ => {
                    tx.say("Cancelled.");
                    return Ok(());
                }
            };
            let added = tx
                .store()
                .await?
                .insert_user(NewUser {
                    name: name.clone(),
                    password_hash: hash,
                    is_admin,
                })
                .await;
            match added {
                Ok(_) => tx.say(format!("User {name} added.")),
                Err(StoreError::Conflict(_)) => tx.say(format!("User {name} already exists.")),
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }

        (Wizard::UserName { action }, StepInput::Message(name)) => {
            pick_user(tx, action, name.trim()).await
        }
        (Wizard::UserRename { id, name }, StepInput::Message(new_name)) => {
            let new_name = new_name.trim();
            if !valid_name(new_name) {
                tx.say(format!("Invalid user name: {new_name:?}."));
                return Ok(());
            }
            let Some(mut user) = tx.store().await?.user_by_id(id).await? else {
                tx.say(format!("No such user: {name}."));
                return Ok(());
            };
            user.name = new_name.to_string();
            match tx.store().await?.update_user(&user).await {
                Ok(()) => tx.say(format!("Renamed {name} to {new_name}.")),
                Err(StoreError::Conflict(_)) => {
                    tx.say(format!("Name {new_name} is already taken."));
                }
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }
        (Wizard::UserReset { id, name }, StepInput::Credential(c)) => {
            if c.password.is_empty() {
                tx.say("Password not reset: empty password.");
                return Ok(());
            }
            let Some(mut user) = tx.store().await?.user_by_id(id).await? else {
                tx.say(format!("No such user: {name}."));
                return Ok(());
            };
            user.password_hash = hash_password(&c.password)?;
            tx.store().await?.update_user(&user).await?;
            tx.say(format!("Password for {name} reset."));
            Ok(())
        }
        (Wizard::UserDrop { id, name }, StepInput::Message(answer)) => {
            if !answer.trim().eq_ignore_ascii_case("yes") {
                tx.say("Cancelled.");
                return Ok(());
            }
            match tx.store().await?.delete_user(id).await {
                Ok(()) => tx.say(format!("User {name} deleted.")),
                Err(StoreError::NotFound(_)) => tx.say(format!("No such user: {name}.")),
                Err(e) => return Err(e.into()),
            }
            Ok(())
        }

        (Wizard::VarName { action }, StepInput::Message(name)) => {
            pick_var(tx, action, name.trim()).await
        }
        (Wizard::VarValue { name }, StepInput::Message(value)) => {
            tx.store().await?.set_variable(&name, value.trim()).await?;
            tx.say(format!("Variable {name} set."));
            Ok(())
        }

        (_, _) => {
            tracing::warn!(user = %tx.user().name, "admin dialog received unexpected input");
            tx.say("Cancelled.");
            Ok(())
        }
    }
}

fn ask(tx: &mut Transaction, what: &str, next: Wizard) {
    let site = format!("{}: {what}", tx.site());
    tx.ask(site);
    tx.set_wizard(next);
}

fn prompt(tx: &mut Transaction, question: &str, next: Wizard) {
    tx.say(question);
    tx.set_wizard(next);
}

async fn list_users(tx: &mut Transaction) -> Result<(), ProtocolError> {
    let users = tx.store().await?.list_users().await?;
    tx.say(format!("{} user(s):", users.len()));
    for user in users {
        let role = if user.is_admin { " (admin)" } else { "" };
        tx.say(format!("  {}{role}", user.name));
    }
    Ok(())
}

async fn list_vars(tx: &mut Transaction) -> Result<(), ProtocolError> {
    let vars = tx.store().await?.list_variables().await?;
    if vars.is_empty() {
        tx.say("No variables set.");
    }
    for var in vars {
        tx.say(format!("  {} = {}", var.name, var.value));
    }
    Ok(())
}

async fn pick_user(
    tx: &mut Transaction,
    action: UserAction,
    name: &str,
) -> Result<(), ProtocolError> {
    let Some(mut target) = tx.store().await?.user_by_name(name).await? else {
        tx.say(format!("No such user: {name}."));
        return Ok(());
    };
    let is_self = target.id == tx.user().id;

    match action {
        UserAction::Demote | UserAction::Reset | UserAction::Drop if is_self => {
            tx.say("Invalid operation: act on another account (use admin setpass for your own password).");
        }
        UserAction::Promote | UserAction::Demote => {
            let promote = action == UserAction::Promote;
            if target.is_admin == promote {
                let state = if promote { "already" } else { "not" };
                tx.say(format!("{name} is {state} an administrator."));
                return Ok(());
            }
            target.is_admin = promote;
            tx.store().await?.update_user(&target).await?;
            let verb = if promote { "promoted" } else { "demoted" };
            tx.say(format!("{name} {verb}."));
        }
        UserAction::Rename => prompt(
            tx,
            &format!("New name for {name}:"),
            Wizard::UserRename {
                id: target.id,
                name: target.name,
            },
        ),
        UserAction::Reset => ask(
            tx,
            &format!("new password for {name}"),
            Wizard::UserReset {
                id: target.id,
                name: target.name,
            },
        ),
        UserAction::Drop => prompt(
            tx,
            &format!("Type YES to delete user {name}."),
            Wizard::UserDrop {
                id: target.id,
                name: target.name,
            },
        ),
        UserAction::List | UserAction::Add => {
            return Err(ProtocolError::Internal(format!(
                "{action:?} does not take a user name"
            )));
        }
    }
    Ok(())
}

async fn pick_var(tx: &mut Transaction, action: VarAction, name: &str) -> Result<(), ProtocolError> {
    if !valid_name(name) {
        tx.say(format!("Invalid variable name: {name:?}."));
        return Ok(());
    }
    match action {
        VarAction::Set => prompt(
            tx,
            &format!("Value for {name}:"),
            Wizard::VarValue {
                name: name.to_string(),
            },
        ),
        VarAction::Drop => {
            if tx.store().await?.drop_variable(name).await? {
                tx.say(format!("Variable {name} dropped."));
            } else {
                tx.say(format!("No such variable: {name}."));
            }
        }
        VarAction::List => {
            return Err(ProtocolError::Internal(
                "var list does not take a name".to_string(),
            ));
        }
    }
    Ok(())
}
