//! Line-oriented terminal front end for headless use.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::session::{Affordances, UiSink, UserAction};

pub const HELP: &str = "Enter = record/stop, s = interrupt, z = refresh Zapier, q = quit";

/// Map one console line to an action.
pub fn parse_command(line: &str) -> Option<UserAction> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Some(UserAction::ToggleRecording),
        "s" => Some(UserAction::Interrupt),
        "z" => Some(UserAction::Refresh),
        "q" | "esc" | "\u{1b}" | "quit" => Some(UserAction::Quit),
        _ => None,
    }
}

/// Forward stdin commands until EOF or the session goes away.
pub async fn read_actions(tx: mpsc::Sender<UserAction>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_command(&line) {
            Some(action) => {
                if tx.send(action).await.is_err() {
                    break;
                }
            }
            None => println!("{}", HELP),
        }
    }
    log::debug!("Console input closed");
    Ok(())
}

/// Prints status changes to stdout.
#[derive(Default)]
pub struct ConsoleUi;

impl UiSink for ConsoleUi {
    fn status(&mut self, text: &str) {
        println!("[status] {}", text);
    }

    fn controls(&mut self, affordances: Affordances) {
        log::debug!("Controls: {:?}", affordances);
    }
}
