use anyhow::Context as _;
use clap::{Parser, Subcommand, ValueEnum};
use fmq::{
    InboxDelivery, JsonFileStore, Message, MessageId, MessageProcessor, MessageQueue, Priority, ProcessLock,
    Settings, Spool, StoreError,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "fmq", version, about = "File-backed message queue and delivery processor")]
struct Cli {
    /// Settings file (TOML, YAML, or JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the queue file from the settings.
    #[arg(long, global = true)]
    queue_file: Option<PathBuf>,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Deliver queued messages until interrupted (the default).
    Run,
    /// Add a message to the tail of the queue.
    ///
    /// While a processor is running, the message goes through its
    /// spool and is queued before the processor's next batch.
    Enqueue {
        #[arg(long = "from")]
        sender: String,
        #[arg(long = "to")]
        recipient: String,
        #[arg(long, default_value_t = Priority::Normal)]
        priority: Priority,
        #[arg(long = "type", default_value = "text")]
        message_type: String,
        #[arg(long, default_value = "direct")]
        category: String,
        content: String,
    },
    /// Print messages at the head of the queue as JSON.
    Peek {
        #[arg(short = 'n', long, default_value_t = 1)]
        count: usize,
    },
    /// Print the number of queued messages.
    Count,
    /// Drop messages already stamped as delivered.
    PurgeDelivered,
    /// Drop every queued message.
    Clear,
    /// Remove a lock left behind by a processor that did not exit
    /// cleanly.
    Unlock,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(error) => {
            tracing::error!("{error:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(format: LogFormat) {
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut settings = Settings::load(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(queue_file) = cli.queue_file {
        settings.queue_file = queue_file;
    }

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => process(&settings).await,
        Command::Enqueue {
            sender,
            recipient,
            priority,
            message_type,
            category,
            content,
        } => {
            let message = Message::new(sender, recipient, content)
                .with_priority(priority)
                .with_type(message_type)
                .with_category(category);
            let id = enqueue(&settings, message).await?;
            output(&id.to_string());
            Ok(ExitCode::SUCCESS)
        }
        Command::Peek { count } => {
            let queue = open(&settings).await;
            let messages = queue.peek(count);
            output(&serde_json::to_string_pretty(&messages)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Count => {
            let queue = open(&settings).await;
            output(&queue.count().to_string());
            Ok(ExitCode::SUCCESS)
        }
        Command::PurgeDelivered => {
            let _lock = lock(&settings).await?;
            let mut queue = open(&settings).await;
            let removed = queue.remove_delivered().await;
            ensure_persisted(&queue)?;
            tracing::info!(removed, "purged delivered messages");
            Ok(ExitCode::SUCCESS)
        }
        Command::Clear => {
            let _lock = lock(&settings).await?;
            let mut queue = open(&settings).await;
            let count = queue.count();
            queue.clear().await;
            ensure_persisted(&queue)?;
            tracing::info!(count, "cleared queue");
            Ok(ExitCode::SUCCESS)
        }
        Command::Unlock => {
            let path = settings.lock_path();
            if ProcessLock::force_release(&path).await? {
                tracing::info!(path = %path.display(), "removed lock");
            } else {
                tracing::info!(path = %path.display(), "no lock to remove");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn enqueue(settings: &Settings, message: Message) -> anyhow::Result<MessageId> {
    let path = settings.lock_path();
    match ProcessLock::acquire(&path).await {
        Ok(lock) => {
            let mut queue = open(settings).await;
            let id = queue.enqueue(message).await;
            ensure_persisted(&queue)?;
            lock.release().await?;
            Ok(id)
        }
        Err(StoreError::Locked { .. }) => {
            let spool = Spool::new(settings.spool_path());
            let submitted = spool
                .submit(&message)
                .await
                .context("failed to submit to the running processor")?;
            tracing::info!(path = %submitted.display(), "queue is in use; submitted through the spool");
            Ok(message.id().clone())
        }
        Err(error) => {
            Err(error).with_context(|| format!("failed to lock the queue ({})", path.display()))
        }
    }
}

async fn process(settings: &Settings) -> anyhow::Result<ExitCode> {
    let lock = lock(settings).await?;
    let queue = open(settings).await;
    let builder = MessageProcessor::build(queue)
        .with_delivery(InboxDelivery::new(&settings.inbox_dir))
        .with_spool(Spool::new(settings.spool_path()))
        .with_settings(settings);
    let builder = match &settings.dead_letter_file {
        Some(path) => builder.with_dead_letter(JsonFileStore::new(path)),
        None => builder,
    };
    let mut processor = builder.build();

    let status = processor.run_forever(fmq::shutdown_signal()).await;
    lock.release().await?;
    Ok(ExitCode::from(u8::try_from(status).unwrap_or(1)))
}

async fn lock(settings: &Settings) -> anyhow::Result<ProcessLock> {
    let path = settings.lock_path();
    ProcessLock::acquire(&path)
        .await
        .with_context(|| format!("the queue is in use (lock file {})", path.display()))
}

async fn open(settings: &Settings) -> MessageQueue<JsonFileStore> {
    MessageQueue::open(JsonFileStore::new(&settings.queue_file)).await
}

fn ensure_persisted(queue: &MessageQueue<JsonFileStore>) -> anyhow::Result<()> {
    anyhow::ensure!(
        queue.persist_failures() == 0,
        "failed to save {}",
        queue.store().path().display()
    );
    Ok(())
}

#[allow(clippy::print_stdout)]
fn output(line: &str) {
    println!("{line}");
}
