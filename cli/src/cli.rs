use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "nsbroker")]
#[command(version)]
#[command(about = "Shared-namespace remote execution broker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a broker
    Serve(ServeArgs),

    /// Run code in a namespace
    Exec(ExecArgs),

    /// Evaluate an expression in a namespace
    Eval(EvalArgs),

    /// Start a deferred execution and print its handle
    Submit(SubmitArgs),

    /// Read the result of a deferred execution
    Read(ReadArgs),

    /// List finished deferred executions
    Poll(PollArgs),

    /// List namespaces
    Ls(LsArgs),

    /// Drop a namespace
    Drop(NamespaceArgs),

    /// Force-release a namespace lock
    Unlock(NamespaceArgs),

    /// Shut down a broker
    Kill(KillArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// Address to listen on
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Accepted password or digest (plain:, sha256:, sha512:, blake3:), can be repeated
    #[arg(long = "password", env = "NSBROKER_PASSWORD")]
    pub passwords: Vec<String>,

    /// Do not create namespaces on first use
    #[arg(long)]
    pub no_new_namespaces: bool,

    /// Namespace that may be created on first use (can be repeated)
    #[arg(long = "allow-namespace")]
    pub namespace_whitelist: Vec<String>,

    /// Shut down when a client connection closes
    #[arg(long)]
    pub kill_on_close: bool,

    /// Log stdin activity as a liveness probe of the parent process
    #[arg(long)]
    pub listen_stdin: bool,

    /// Serve one connection over stdin/stdout instead of listening
    #[arg(long)]
    pub stdio: bool,

    /// Create a namespace at startup: NAMESPACE[=CODE] (can be repeated)
    #[arg(long = "init")]
    pub inits: Vec<String>,

    /// Export a local namespace: NAMESPACE=HOSTSPEC (can be repeated)
    #[arg(long = "export")]
    pub exports: Vec<String>,

    /// Import a remote namespace: NAMESPACE=HOSTSPEC (can be repeated)
    #[arg(long = "import")]
    pub imports: Vec<String>,
}

/// Where a client command connects to
#[derive(Args)]
pub struct ConnectArgs {
    /// Broker host spec or alias: [socket://][password@]host[:port][/namespace] or shell://command
    pub hostspec: String,

    /// Password, overriding the host spec's
    #[arg(long, env = "NSBROKER_PASSWORD")]
    pub password: Option<String>,

    /// Namespace, overriding the host spec's
    #[arg(short, long)]
    pub namespace: Option<String>,
}

#[derive(Args)]
pub struct ExecArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Code to run
    pub code: String,
}

#[derive(Args)]
pub struct EvalArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Expression to evaluate
    pub expr: String,

    /// Do not take the namespace lock
    #[arg(long)]
    pub unlocked: bool,
}

#[derive(Args)]
pub struct SubmitArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Code to run
    pub code: String,

    /// Expression to evaluate after the code
    #[arg(long)]
    pub expr: Option<String>,
}

#[derive(Args)]
pub struct ReadArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Result id printed by `submit`
    pub id: String,

    /// Wait until the result is ready
    #[arg(long, conflicts_with = "timeout")]
    pub wait: bool,

    /// Wait at most this many seconds
    #[arg(long)]
    pub timeout: Option<f64>,
}

#[derive(Args)]
pub struct PollArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}

#[derive(Args)]
pub struct LsArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// List remote namespaces instead of local ones
    #[arg(long)]
    pub remote: bool,

    /// With --remote, show the peer serving each namespace
    #[arg(long, requires = "remote")]
    pub origins: bool,
}

#[derive(Args)]
pub struct NamespaceArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,

    /// Namespace to operate on
    pub target: String,
}

#[derive(Args)]
pub struct KillArgs {
    #[command(flatten)]
    pub connect: ConnectArgs,
}
