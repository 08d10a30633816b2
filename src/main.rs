use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use notecard::{transport::SerialTransport, Config, Notecard, Request, Upload};

macro_rules! vprintln {
    ($verbose:expr, $($arg:tt)*) => {
        if $verbose {
            println!($($arg)*);
        }
    };
}

#[derive(Parser)]
#[command(name = "notecard")]
#[command(about = "Notecard host driver CLI", long_about = None)]
struct NotecardCLI {
    /// Serial device the card is attached to
    #[arg(short, long, global = true, default_value = "/dev/ttyACM0")]
    port: String,

    /// Baud rate
    #[arg(short, long, global = true, default_value_t = 9600)]
    baud: u32,

    /// TOML file overriding protocol timings and retry budgets
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one JSON request or command and print the response
    Transact {
        /// e.g. '{"req":"card.version"}'
        json: String,
    },

    /// Resynchronize the serial channel with the card
    Reset,

    /// Inspect or move data through the binary store
    Binary {
        #[command(subcommand)]
        command: BinaryCommands,
    },

    /// Upload a file to a route through the binary store
    Upload {
        file: PathBuf,

        /// Route alias the card relays to
        #[arg(short, long)]
        route: String,

        /// Largest chunk to stage at once (default: store capacity)
        #[arg(long)]
        chunk_size: Option<usize>,

        /// MIME type sent with each chunk
        #[arg(long, default_value = "application/octet-stream")]
        content: String,

        /// Target name passed to the route
        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        label: Option<String>,
    },
}

#[derive(Subcommand)]
enum BinaryCommands {
    /// Show staged length and capacity
    Status,

    /// Discard the store's contents
    Clear,

    /// Append a file to the store
    Put {
        file: PathBuf,

        /// Must equal the store's current length
        #[arg(short, long, default_value_t = 0)]
        offset: usize,
    },

    /// Read bytes back from the store
    Get {
        offset: usize,
        length: usize,

        /// Write to a file instead of printing hex
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<notecard::Error>> {
    let cli = NotecardCLI::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    vprintln!(cli.verbose, "Opening {} at {} baud", cli.port, cli.baud);
    let transport = SerialTransport::open(&cli.port, cli.baud, &config)?;
    let card = Notecard::builder(transport).config(config).open()?;

    let result = match cli.command {
        Commands::Transact { json } => transact(&card, &json),
        Commands::Reset => card.reset().map(|()| println!("Card in sync.")),
        Commands::Binary { command } => binary(&card, command, cli.verbose),
        Commands::Upload { file, route, chunk_size, content, name, label } => {
            upload(&card, &file, route, chunk_size, content, name, label, cli.verbose)
        }
    };

    if let Err(e) = &result {
        log::error!("{}", e);
    }
    result.map_err(Box::new)
}

fn read_file(path: &Path) -> Result<Vec<u8>, notecard::Error> {
    std::fs::read(path).map_err(|e| {
        notecard::Error::Precondition(format!("failed to read {}: {}", path.display(), e))
    })
}

fn transact(card: &Notecard, json: &str) -> Result<(), notecard::Error> {
    let request: Request = json.parse()?;
    match card.transact(&request)? {
        Some(response) => println!("{}", serde_json::to_string(&response)?),
        None => println!("Sent {}.", request.name()),
    }
    Ok(())
}

fn binary(card: &Notecard, command: BinaryCommands, verbose: bool) -> Result<(), notecard::Error> {
    let store = card.binary();
    match command {
        BinaryCommands::Status => {
            let status = store.status()?;
            println!("Length:   {}", status.length);
            println!("Capacity: {}", status.max);
        }
        BinaryCommands::Clear => {
            store.reset()?;
            vprintln!(verbose, "Binary store cleared.");
        }
        BinaryCommands::Put { file, offset } => {
            let data = read_file(&file)?;
            store.transmit(&data, offset)?;
            println!("Stored {} byte(s) at offset {}.", data.len(), offset);
        }
        BinaryCommands::Get { offset, length, out } => {
            let data = store.receive(offset, length)?;
            match out {
                Some(path) => {
                    std::fs::write(&path, &data).map_err(|e| {
                        notecard::Error::Precondition(format!(
                            "failed to write {}: {}",
                            path.display(),
                            e
                        ))
                    })?;
                    vprintln!(verbose, "Wrote {} byte(s) to {}", data.len(), path.display());
                }
                None => {
                    for line in data.chunks(16) {
                        let hex: Vec<String> = line.iter().map(|b| format!("{:02x}", b)).collect();
                        println!("{}", hex.join(" "));
                    }
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn upload(
    card: &Notecard,
    file: &Path,
    route: String,
    chunk_size: Option<usize>,
    content: String,
    name: Option<String>,
    label: Option<String>,
    verbose: bool,
) -> Result<(), notecard::Error> {
    let data = read_file(file)?;

    let mut upload = Upload::new(route).content_type(content).progress(|p| {
        println!(
            "Chunk {}/{}: {}/{} bytes ({:.1}%), {:.0} B/s, {:.0}s left",
            p.chunk_index,
            p.chunk_count,
            p.bytes_sent,
            p.total_bytes,
            p.percent,
            p.average_bps,
            p.eta.as_secs_f64()
        )
    });
    if let Some(size) = chunk_size {
        upload = upload.max_chunk_size(size);
    }
    if let Some(name) = name {
        upload = upload.name(name);
    }
    if let Some(label) = label {
        upload = upload.label(label);
    }

    let stats = upload.send(card, &data)?;
    println!(
        "Uploaded {} byte(s) in {} chunk(s), {:.2}s",
        stats.bytes,
        stats.chunks,
        stats.elapsed.as_secs_f64()
    );
    vprintln!(verbose, "Average throughput: {:.0} B/s", stats.average_bps);
    Ok(())
}
