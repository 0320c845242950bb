use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the certpress binary.
#[derive(Debug, Parser)]
#[command(
    name = "certpress",
    version,
    about = "Course certificate rendering service"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CERTPRESS_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the certificate HTTP service.
    Serve(Box<ServeArgs>),
    /// Render a single certificate to a local file.
    Render(Box<RenderArgs>),
    /// Render a payment receipt to a local file.
    Receipt(Box<ReceiptArgs>),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub overrides: RenderOverrides,

    /// Name printed on the certificate.
    #[arg(long, value_name = "NAME")]
    pub name: String,

    /// Course the certificate is issued for.
    #[arg(long, value_name = "COURSE")]
    pub course: String,

    /// Issue date as printed; defaults to today.
    #[arg(long, value_name = "DATE")]
    pub date: Option<String>,

    /// Owner recorded for the certificate.
    #[arg(long, value_name = "USER", default_value = "local")]
    pub owner: String,

    /// Where to write the PDF.
    #[arg(long, short = 'o', value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}

#[derive(Debug, Args, Clone)]
pub struct ReceiptArgs {
    #[command(flatten)]
    pub overrides: RenderOverrides,

    /// Payer name.
    #[arg(long, value_name = "NAME")]
    pub name: String,

    /// Payer email address.
    #[arg(long, value_name = "EMAIL")]
    pub email: String,

    /// Course that was paid for.
    #[arg(long, value_name = "COURSE")]
    pub course: String,

    /// Amount paid, in rupees with up to two decimals.
    #[arg(long, value_name = "AMOUNT")]
    pub amount: String,

    /// Payment gateway payment id.
    #[arg(long = "payment-id", value_name = "ID")]
    pub payment_id: String,

    /// Payment gateway order id.
    #[arg(long = "order-id", value_name = "ID")]
    pub order_id: String,

    /// Payment date as printed; defaults to today.
    #[arg(long, value_name = "DATE")]
    pub date: Option<String>,

    /// Where to write the PDF.
    #[arg(long, short = 'o', value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the rendering engine executable.
    #[arg(long = "render-executable-path", value_name = "PATH")]
    pub executable_path: Option<PathBuf>,

    /// Override the wall-clock render deadline.
    #[arg(long = "render-deadline-seconds", value_name = "SECONDS")]
    pub deadline_seconds: Option<u64>,

    /// Toggle headless mode for the rendering engine.
    #[arg(
        long = "render-headless",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub headless: Option<bool>,

    /// Override the directory rendered certificates are written to.
    #[arg(long = "artifacts-directory", value_name = "PATH")]
    pub artifacts_directory: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub render: RenderOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,
}
