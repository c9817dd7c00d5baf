//! Interface de linha de comando do batchflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (demo, topics, config)
//! e flags globais (--config, --max-retries, --verbose, --json-logs).

use std::path::PathBuf;

use batchflow::model::TransactionKind;
use batchflow::topic::StageTopic;
use clap::{Args, Parser, Subcommand, ValueEnum};

/// batchflow: orquestrador de estágios para pipelines de lotes de documentos.
#[derive(Debug, Parser)]
#[command(name = "batchflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Caminho de um arquivo de configuração alternativo.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Número máximo de retentativas em caso de falha transitória.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emite os logs em JSON, uma linha por evento.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

/// Tipo de transação aceito pela CLI, mapeado para [`TransactionKind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum KindArg {
    /// Extração de documentos com montagem e chamada de API.
    Processing,
    /// Lotes de treinamento, concluídos sem montagem.
    Training,
}

impl From<KindArg> for TransactionKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Processing => TransactionKind::Processing,
            KindArg::Training => TransactionKind::Training,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Executa uma transação de ponta a ponta contra workers simulados em memória.
    Demo(DemoArgs),

    /// Lista os tópicos de estágio conhecidos.
    Topics,

    /// Mostra a configuração efetiva em TOML.
    Config,
}

#[derive(Debug, Args)]
pub struct DemoArgs {
    /// Quantidade de lotes gerados pela divisão da transação.
    #[arg(long, default_value_t = 3)]
    pub batches: usize,

    /// Tipo da transação.
    #[arg(long, value_enum, default_value_t = KindArg::Processing)]
    pub kind: KindArg,

    /// Tópico que responde 503 nas primeiras tentativas.
    #[arg(long)]
    pub transient_failure: Option<StageTopic>,

    /// Quantas tentativas do tópico transitório falham.
    #[arg(long, default_value_t = 1)]
    pub transient_attempts: u32,

    /// Tópico que rejeita (400) o primeiro lote que o alcança.
    #[arg(long)]
    pub terminal_failure: Option<StageTopic>,

    /// Continua com os lotes restantes quando um lote falha.
    #[arg(long, default_value_t = false)]
    pub partial: bool,

    /// Desliga o envio final de documentos.
    #[arg(long, default_value_t = false)]
    pub no_doc_upload: bool,

    /// Atraso entre retentativas, em milissegundos.
    #[arg(long, default_value_t = 200)]
    pub retry_delay_ms: u64,

    /// Latência simulada de cada worker, em milissegundos.
    #[arg(long, default_value_t = 20)]
    pub latency_ms: u64,

    /// Tempo máximo de espera pela conclusão, em segundos.
    #[arg(long, default_value_t = 30)]
    pub timeout_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_demo_defaults() {
        let cli = Cli::parse_from(["batchflow", "demo"]);
        match cli.command {
            Command::Demo(args) => {
                assert_eq!(args.batches, 3);
                assert_eq!(args.kind, KindArg::Processing);
                assert!(args.transient_failure.is_none());
                assert_eq!(args.retry_delay_ms, 200);
                assert!(!args.partial);
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_parses_failure_topics() {
        let cli = Cli::parse_from([
            "batchflow",
            "demo",
            "--kind",
            "training",
            "--transient-failure",
            "keyval_extractor",
            "--transient-attempts",
            "2",
            "--terminal-failure",
            "output_json",
            "--partial",
        ]);
        match cli.command {
            Command::Demo(args) => {
                assert_eq!(TransactionKind::from(args.kind), TransactionKind::Training);
                assert_eq!(args.transient_failure, Some(StageTopic::KeyvalExtractor));
                assert_eq!(args.transient_attempts, 2);
                assert_eq!(args.terminal_failure, Some(StageTopic::OutputJson));
                assert!(args.partial);
            }
            _ => panic!("expected Demo command"),
        }
    }

    #[test]
    fn cli_rejects_unknown_topic() {
        let result = Cli::try_parse_from(["batchflow", "demo", "--terminal-failure", "ocr"]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from([
            "batchflow",
            "--max-retries",
            "5",
            "--verbose",
            "--json-logs",
            "topics",
        ]);
        assert!(cli.verbose);
        assert!(cli.json_logs);
        assert_eq!(cli.max_retries, Some(5));
        assert!(matches!(cli.command, Command::Topics));
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
