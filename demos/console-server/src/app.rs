//! Demo console logic.

use std::time::Duration;

use async_trait::async_trait;
use netconsole_protocol::{
    ClientMode, Completed, ConsoleApp, ProcType, ProtocolError, Transaction,
};
use serde::{Deserialize, Serialize};

const MAX_COUNT: u32 = 100;
const DEFAULT_COUNT: u32 = 5;

const HELP: &str = "\
Commands:
  help          show this text
  whoami        show your account
  count [n]     count to n slowly; stop cancels
  partner       sign in to a partner site
  token <text>  offer text for copying
  cls           clear the console
  logout        end the session";

/// Application context kept in the session between transactions.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Context {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    count: Option<Count>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Count {
    done: u32,
    target: u32,
}

impl Context {
    fn load(tx: &Transaction) -> Result<Self, ProtocolError> {
        let bytes = tx.context()?;
        if bytes.is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_slice(bytes)
            .map_err(|e| ProtocolError::Internal(format!("bad demo context: {e}")))
    }

    fn store(&self, tx: &mut Transaction) -> Result<(), ProtocolError> {
        let bytes = serde_json::to_vec(self)
            .map_err(|e| ProtocolError::Internal(format!("bad demo context: {e}")))?;
        tx.set_context(bytes)
    }
}

pub struct DemoApp {
    step_delay: Duration,
}

impl DemoApp {
    pub const fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    async fn hello(tx: &mut Transaction) -> Result<(), ProtocolError> {
        let name = tx.current_user()?.name.clone();
        tx.console_print(format!("Welcome, {name}. Type help for commands."))?;
        if let Some(motd) = tx.var("motd").await? {
            tx.console_print(motd)?;
        }
        Ok(())
    }

    fn message(tx: &mut Transaction) -> Result<(), ProtocolError> {
        let text = tx.message_data()?.trim().to_string();
        let (command, arg) = text
            .split_once(char::is_whitespace)
            .map_or((text.as_str(), ""), |(c, a)| (c, a.trim()));

        match command.to_ascii_lowercase().as_str() {
            "" => {}
            "help" => tx.console_print(HELP)?,
            "whoami" => {
                let user = tx.current_user()?;
                let role = if user.is_admin { "administrator" } else { "user" };
                let line = format!("{} ({role})", user.name);
                tx.console_print(line)?;
            }
            "count" => {
                let target = if arg.is_empty() {
                    DEFAULT_COUNT
                } else if let Some(n) = arg.parse::<u32>().ok().filter(|n| (1..=MAX_COUNT).contains(n)) {
                    n
                } else {
                    tx.console_print(format!("count takes a number from 1 to {MAX_COUNT}."))?;
                    return Ok(());
                };
                Context {
                    count: Some(Count { done: 0, target }),
                }
                .store(tx)?;
                tx.console_print(format!("Counting to {target}."))?;
                tx.client_mode(ClientMode::Begin)?;
            }
            "partner" => tx.client_mode(ClientMode::Ask {
                site: "Partner site".to_string(),
            })?,
            "token" if !arg.is_empty() => tx.console_token(arg)?,
            _ => tx.console_print(format!("Unknown command: {command}. Type help."))?,
        }
        Ok(())
    }

    fn credential(tx: &mut Transaction) -> Result<(), ProtocolError> {
        if tx.has_cancel()? {
            tx.console_print("Partner sign-in cancelled.")?;
            return Ok(());
        }
        let name = tx.name_cred()?.to_string();
        if tx.pass_cred()?.is_empty() {
            tx.console_print("Partner sign-in needs a password.")?;
            return Ok(());
        }
        tx.console_print(format!("Signed in to the partner site as {name}."))
    }

    async fn resume(&self, tx: &mut Transaction) -> Result<(), ProtocolError> {
        let mut context = Context::load(tx)?;
        let Some(mut count) = context.count.take() else {
            return Err(ProtocolError::Internal(
                "resume without a running count".to_string(),
            ));
        };

        if tx.has_cancel()? {
            tx.console_print(format!("Stopped at {} of {}.", count.done, count.target))?;
            return context.store(tx);
        }

        tokio::time::sleep(self.step_delay).await;
        count.done += 1;
        tx.console_print(count.done.to_string())?;
        if count.done < count.target {
            context.count = Some(count);
            tx.client_mode(ClientMode::Proceed)?;
        } else {
            tx.console_print("Done.")?;
        }
        context.store(tx)
    }
}

#[async_trait]
impl ConsoleApp for DemoApp {
    async fn handle(&self, mut tx: Transaction) -> Result<Completed, ProtocolError> {
        match tx.proc_type() {
            ProcType::Nop | ProcType::Logout => {}
            ProcType::Hello => Self::hello(&mut tx).await?,
            ProcType::Message => Self::message(&mut tx)?,
            ProcType::Credential => Self::credential(&mut tx)?,
            ProcType::Resume => self.resume(&mut tx).await?,
        }
        tx.complete().await
    }
}
