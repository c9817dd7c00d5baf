//! Interface de terminal do batchflow: spinner e saída colorida.
//!
//! Usa as crates `indicatif` para o spinner de progresso e `console` para
//! estilização com cores. O [`DemoProgress`] acompanha visualmente uma
//! transação da demonstração no terminal.

use std::fmt;

use batchflow::audit::{AuditEntry, Notification, NotificationOutcome};
use batchflow::state_machine::TransactionStatus;
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

/// Indicador visual de progresso para uma transação no terminal.
///
/// Exibe um spinner animado durante o processamento e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e retentativa (amarelo).
pub struct DemoProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl DemoProgress {
    /// Inicia o spinner com a descrição da transação.
    pub fn start(description: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("RECEIVED: {description}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    /// Atualiza a mensagem do spinner para o status atual.
    pub fn update(&self, status: impl fmt::Display) {
        self.pb.set_message(status.to_string().to_uppercase());
    }

    /// Finaliza o spinner e exibe o status final da transação.
    pub fn complete(&self, transaction_id: &str, status: Option<TransactionStatus>) {
        self.pb.finish_and_clear();
        match status {
            Some(TransactionStatus::Completed) => {
                println!("  {} Transaction {transaction_id} completed", self.green.apply_to("✓"));
            }
            Some(TransactionStatus::Failed) => {
                println!("  {} Transaction {transaction_id} failed", self.red.apply_to("✗"));
            }
            Some(other) => {
                println!(
                    "  {} Transaction {transaction_id} still {other}",
                    self.yellow.apply_to("…")
                );
            }
            None => println!("  {} Transaction {transaction_id} not found", self.red.apply_to("✗")),
        }
    }

    /// Imprime a linha do tempo de auditoria de um dono (lote ou transação).
    pub fn print_timeline(&self, owner_id: &str, entries: &[AuditEntry]) {
        println!();
        println!("{}", self.dim.apply_to(format!("─── {owner_id} ───")));
        for entry in entries {
            let style = match entry.status.as_str() {
                "completed" => &self.green,
                "failed" => &self.red,
                "transient_failure" | "retry_scheduled" => &self.yellow,
                _ => &self.dim,
            };
            println!(
                "  {} {:<20} {}",
                entry.timestamp.format("%H:%M:%S%.3f"),
                style.apply_to(&entry.status),
                entry.message
            );
        }
    }

    /// Imprime as notificações terminais emitidas.
    pub fn print_notifications(&self, notifications: &[Notification]) {
        println!();
        for notification in notifications {
            let style = match notification.outcome {
                NotificationOutcome::Success => &self.green,
                NotificationOutcome::Failure => &self.red,
            };
            println!(
                "  {} notify {}: {}",
                style.apply_to(notification.outcome),
                notification.owner_id,
                notification.detail
            );
        }
    }
}
