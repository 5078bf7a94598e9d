//! Console - 端末上のオペレーター
//!
//! OperatorHandle から届く notice を stderr に表示し、判断が必要な
//! escalation では stdin から 1 行読んで OperatorCommand として返す。
//!
//! # 設計
//! - stdin は専用スレッドで読む（tokio の stdin は対話用途に向かない）
//! - 入力待ちは engine 側が諦めたら（oneshot が閉じたら）打ち切る
//! - stdin が閉じたら返信しない。escalation は deferred になる

use std::io::BufRead;

use keel_core::app::{Notice, OperatorHandle};
use keel_core::domain::{HealthEvent, OperatorCommand, ParseCommandError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const PROMPT: &str =
    "decide: resume | retry <task> | skip <task> | recover [<point>] | pause | abort\nkeel> ";

pub struct Console {
    operator: OperatorHandle,
    lines: Option<mpsc::Receiver<String>>,
}

impl Console {
    pub fn new(operator: OperatorHandle) -> Self {
        Self {
            operator,
            lines: None,
        }
    }

    /// Runs until the engine reports that it finished.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        while let Some(notice) = self.operator.next_notice().await {
            match notice {
                Notice::Escalation {
                    escalation,
                    reply: Some(reply),
                } => {
                    eprintln!("\n{}", escalation.render());
                    self.ask(reply).await;
                }
                Notice::Escalation {
                    escalation,
                    reply: None,
                } => {
                    eprintln!("\n{}", escalation.render());
                    if escalation.needs_decision() {
                        eprintln!("  (deferred; decide later with `keel retry` or `keel recover`)");
                    }
                }
                Notice::Health(event) => eprintln!("{}", render_health(&event)),
                Notice::Digest(events) => eprint!("{}", render_digest(&events)),
                Notice::Finished(_) => break,
            }
        }
    }

    async fn ask(&mut self, mut reply: oneshot::Sender<OperatorCommand>) {
        let lines = self.lines.get_or_insert_with(stdin_lines);
        loop {
            eprint!("{PROMPT}");
            let line = tokio::select! {
                _ = reply.closed() => return,
                line = lines.recv() => line,
            };
            let Some(line) = line else {
                eprintln!();
                return;
            };
            match line.parse::<OperatorCommand>() {
                Ok(command) => {
                    let _ = reply.send(command);
                    return;
                }
                Err(ParseCommandError::Empty) => {}
                Err(e) => eprintln!("{e}"),
            }
        }
    }
}

/// Lines from stdin, read on a dedicated thread.
fn stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(8);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else { break };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

fn render_health(event: &HealthEvent) -> String {
    format!("HEALTH {event}")
}

fn render_digest(events: &[HealthEvent]) -> String {
    let mut out = format!("health digest: {} warning(s)\n", events.len());
    for event in events {
        out.push_str(&format!("  {event}\n"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keel_core::domain::Severity;

    #[test]
    fn digest_lists_every_event() {
        let events = vec![
            HealthEvent::new(Utc::now(), "memory_percent", 88.0, 85.0, Severity::Warning, "memory"),
            HealthEvent::new(Utc::now(), "error_rate", 3.0, 3.0, Severity::Warning, "3 failures"),
        ];
        let text = render_digest(&events);
        assert!(text.starts_with("health digest: 2 warning(s)"));
        assert_eq!(text.lines().count(), 3);
    }
}
