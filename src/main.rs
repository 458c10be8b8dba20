use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rexec_lite::client::{presigned_push, tail, ExecClient, TailOptions};
use rexec_lite::config::{ClientConfig, JobConfig, ServerConfig};
use rexec_lite::node::Node;
use rexec_lite::protocol::{PostRequest, PullKeys, PushUrls};
use rexec_lite::shutdown::install_shutdown_handler;
use rexec_lite::store::{FsStore, UrlSigner};
use rexec_lite::worker::Registry;

#[derive(Parser, Debug)]
#[command(name = "rexec-lite")]
#[command(version)]
#[command(about = "Remote command execution with resumable log tailing")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the dispatcher and worker pool
    Server(ServerArgs),

    /// Run a subprocess remotely and stream its log
    Exec {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        push: PushArgs,

        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },

    /// Call a registered procedure remotely and stream its log
    Rpc {
        #[command(flatten)]
        client: ClientArgs,

        #[command(flatten)]
        push: PushArgs,

        /// Procedure name
        name: String,

        /// JSON arguments passed to the procedure
        #[arg(default_value = "{}")]
        args: String,
    },

    /// Follow a job's log directly from a local data directory
    Tail {
        /// Root of the object store
        #[arg(long)]
        data_dir: PathBuf,

        /// Log object key
        #[arg(long)]
        log: String,

        /// Size object key
        #[arg(long)]
        size: String,

        /// Exit object key
        #[arg(long)]
        exit: String,

        /// Poll interval in milliseconds
        #[arg(long, default_value = "1000")]
        poll_ms: u64,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: SocketAddr,

    /// Externally reachable base url for signed log urls (default: http://<listen>)
    #[arg(long, env = "REXEC_PUBLIC_URL")]
    public_url: Option<String>,

    /// Root directory of the object store
    #[arg(long, default_value = "rexec-data")]
    data_dir: PathBuf,

    /// JSON file of auth records
    #[arg(long, env = "REXEC_AUTH_FILE")]
    auth_file: Option<PathBuf>,

    /// Hex-encoded 32 byte key for signing blob urls (random if unset)
    #[arg(long, env = "REXEC_SIGNING_KEY", hide_env_values = true)]
    signing_key: Option<String>,

    /// Jobs run concurrently
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Jobs queued before submissions are refused
    #[arg(long, default_value = "64")]
    queue_capacity: usize,

    /// Per-job deadline in seconds
    #[arg(long, default_value = "840")]
    job_timeout_secs: u64,

    /// Log bytes kept per job before truncation
    #[arg(long, default_value = "33554432")]
    max_log_bytes: u64,

    /// Minimum milliseconds between log ships
    #[arg(long, default_value = "1000")]
    ship_interval_ms: u64,
}

// =============================================================================
// Client Arguments (shared by exec and rpc)
// =============================================================================

#[derive(clap::Args, Debug)]
struct ClientArgs {
    /// Server base url
    #[arg(long, short = 'u', env = "REXEC_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Bearer secret
    #[arg(long, env = "REXEC_AUTH", hide_env_values = true)]
    auth: String,
}

#[derive(clap::Args, Debug)]
struct PushArgs {
    /// Push the log to this url instead of following it
    #[arg(long, requires_all = ["push_size", "push_exit"])]
    push_log: Option<String>,

    #[arg(long, requires = "push_log")]
    push_size: Option<String>,

    #[arg(long, requires = "push_log")]
    push_exit: Option<String>,

    /// Push results into the server's store under this key prefix,
    /// through urls signed with the server's key
    #[arg(long, conflicts_with = "push_log", requires = "signing_key")]
    push_prefix: Option<String>,

    /// Hex-encoded signing key shared with the server
    #[arg(long, env = "REXEC_SIGNING_KEY", hide_env_values = true)]
    signing_key: Option<String>,

    /// Lifetime of urls minted for --push-prefix, in seconds
    #[arg(long, default_value = "3600")]
    push_ttl_secs: u64,
}

impl PushArgs {
    fn urls(self, base_url: &str) -> Result<Option<PushUrls>, Box<dyn std::error::Error>> {
        if let (Some(prefix), Some(key)) = (&self.push_prefix, &self.signing_key) {
            let signer = UrlSigner::new(base_url, UrlSigner::key_from_hex(key)?)?;
            let ttl = Duration::from_secs(self.push_ttl_secs);
            let (urls, keys) = presigned_push(&signer, prefix, ttl)?;
            tracing::info!(log = %keys.log, size = %keys.size, exit = %keys.exit, "Results will be pushed into the server store");
            return Ok(Some(urls));
        }
        Ok(match (self.push_log, self.push_size, self.push_exit) {
            (Some(log), Some(size), Some(exit)) => Some(PushUrls { log, size, exit }),
            _ => None,
        })
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn write_stdout(bytes: &[u8]) {
    let mut out = std::io::stdout().lock();
    if let Err(e) = out.write_all(bytes).and_then(|_| out.flush()) {
        tracing::warn!(error = %e, "Failed to write to stdout");
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let job = JobConfig {
        timeout: Duration::from_secs(args.job_timeout_secs),
        log_ship_interval: Duration::from_millis(args.ship_interval_ms),
        max_log_bytes: args.max_log_bytes,
        ..JobConfig::default()
    };
    let mut config = ServerConfig::new(args.listen, args.data_dir).with_job(job);
    if let Some(url) = args.public_url {
        config = config.with_public_url(url);
    }
    if let Some(path) = args.auth_file {
        config = config.with_auth_file(path);
    }
    config.signing_key = args.signing_key;
    config.worker_concurrency = args.workers;
    config.queue_capacity = args.queue_capacity;

    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        workers = config.worker_concurrency,
        "Starting rexec-lite server"
    );

    let shutdown = install_shutdown_handler();
    let node = Node::new(config, Registry::builtin()).await?;
    node.run(shutdown).await?;
    Ok(())
}

async fn run_client(
    client: ClientArgs,
    request: PostRequest,
) -> Result<i32, Box<dyn std::error::Error>> {
    let client = ExecClient::new(ClientConfig::new(client.url, client.auth));
    match client.exec(&request, write_stdout).await? {
        Some(exit) => Ok(exit),
        None => {
            eprintln!("Job submitted; output is pushed to the given urls.");
            Ok(0)
        }
    }
}

async fn run_tail(
    data_dir: PathBuf,
    keys: PullKeys,
    poll: Duration,
) -> Result<i32, Box<dyn std::error::Error>> {
    let store = FsStore::new(data_dir);
    let options = TailOptions {
        poll_interval: poll,
        ..TailOptions::default()
    };
    let shutdown = install_shutdown_handler();
    Ok(tail(&store, &keys, &options, &shutdown, write_stdout).await?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing();

    let exit = match args.command {
        Commands::Server(server_args) => {
            run_server(server_args).await?;
            0
        }
        Commands::Exec { client, push, argv } => {
            let mut request = PostRequest::subprocess(argv);
            request.push_urls = push.urls(&client.url)?;
            run_client(client, request).await?
        }
        Commands::Rpc {
            client,
            push,
            name,
            args,
        } => {
            let mut request = PostRequest::rpc(name, args);
            request.push_urls = push.urls(&client.url)?;
            run_client(client, request).await?
        }
        Commands::Tail {
            data_dir,
            log,
            size,
            exit,
            poll_ms,
        } => {
            let keys = PullKeys { log, size, exit };
            run_tail(data_dir, keys, Duration::from_millis(poll_ms)).await?
        }
    };

    std::process::exit(exit);
}
