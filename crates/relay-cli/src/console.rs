use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use relay_core::{ChannelSender, Orchestrator};
use relay_types::{InboundMessage, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info};
use uuid::Uuid;

/// Local chat on the terminal: replies go to stdout.
pub struct ConsoleChannel {
    jid: String,
}

impl ConsoleChannel {
    pub fn new(folder: &str) -> Self {
        Self {
            jid: console_jid(folder),
        }
    }
}

pub fn console_jid(folder: &str) -> String {
    format!("console:{folder}")
}

impl ChannelSender for ConsoleChannel {
    fn owns_jid(&self, jid: &str) -> bool {
        jid == self.jid
    }

    fn send_message(
        &self,
        _jid: &str,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let text = text.to_string();
        Box::pin(async move {
            println!("{text}");
            Ok(())
        })
    }
}

/// Build the inbound message for one line typed on the console.
pub fn console_message(jid: &str, line: &str) -> InboundMessage {
    InboundMessage {
        id: Uuid::new_v4().to_string(),
        chat_jid: jid.to_string(),
        sender: "console".to_string(),
        sender_name: Some("You".to_string()),
        content: line.to_string(),
        timestamp: Utc::now(),
        is_from_me: false,
    }
}

/// Feed stdin lines into the orchestrator until EOF or shutdown.
pub async fn read_stdin(
    orchestrator: Arc<Orchestrator>,
    folder: String,
    shutdown: broadcast::Receiver<()>,
) {
    let stdin = BufReader::new(tokio::io::stdin());
    read_lines(orchestrator, folder, stdin, shutdown).await;
}

async fn read_lines<R>(
    orchestrator: Arc<Orchestrator>,
    folder: String,
    reader: R,
    mut shutdown: broadcast::Receiver<()>,
) where
    R: AsyncBufRead + Unpin,
{
    let jid = console_jid(&folder);
    let mut lines = reader.lines();
    info!(jid = %jid, "Console ready, type a message");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line,
            _ = shutdown.recv() => {
                info!("Console closed for shutdown");
                break;
            }
        };
        match line {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                if let Err(e) = orchestrator
                    .handle_inbound(console_message(&jid, &line))
                    .await
                {
                    error!(error = %e, "Failed to handle console input");
                }
            }
            Ok(None) => {
                info!("Console input closed");
                break;
            }
            Err(e) => {
                error!(error = %e, "Failed to read console input");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use relay_config::Config;
    use relay_core::GracefulShutdown;
    use relay_db::Database;

    #[test]
    fn owns_only_its_jid() {
        let channel = ConsoleChannel::new("main");
        assert!(channel.owns_jid("console:main"));
        assert!(!channel.owns_jid("console:acme"));
        assert!(!channel.owns_jid("tg:main"));
    }

    #[test]
    fn console_messages_have_unique_ids() {
        let a = console_message("console:main", "hi");
        let b = console_message("console:main", "hi");
        assert_ne!(a.id, b.id);
        assert_eq!(a.chat_jid, "console:main");
        assert!(!a.is_from_me);
    }

    #[tokio::test]
    async fn shutdown_stops_the_reader() {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::in_memory().await.unwrap();
        db.initialize().await.unwrap();
        let orchestrator = Arc::new(Orchestrator::new(
            Config::with_base_dir(tmp.path()),
            Arc::new(db),
            Vec::new(),
        ));

        // Input that never arrives
        let (_writer, reader) = tokio::io::duplex(64);
        let shutdown = GracefulShutdown::new();
        let task = tokio::spawn(read_lines(
            orchestrator,
            "main".to_string(),
            BufReader::new(reader),
            shutdown.subscribe(),
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!task.is_finished());

        shutdown.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
