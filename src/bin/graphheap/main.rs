//! Binary entry point for the graphheap region tool.
#![forbid(unsafe_code)]

mod ui;

use std::error::Error;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use graphheap::config::RegionConfig;
use graphheap::primitives::io::{FileIo, StdFileIo};
use graphheap::region::descriptor::{DescriptorSnapshot, DESCRIPTOR_LEN};
use graphheap::region::layout::BARRIER_SLOTS;
use graphheap::{FlushServer, FlushServerStats, NodeId, Region, RegionStats, Topology};
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

use ui::{format_bytes, format_ms, Theme, Ui};

#[derive(Parser, Debug)]
#[command(
    name = "graphheap",
    version,
    about = "Create, inspect, and coordinate shared graph regions",
    disable_help_subcommand = true
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "GRAPHHEAP_CONFIG",
        value_name = "FILE",
        help = "Region configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = OutputFormat::Text,
        help = "Output format for structured responses"
    )]
    format: OutputFormat,

    #[arg(
        long,
        global = true,
        value_enum,
        default_value_t = Theme::Auto,
        help = "Color theme for text output"
    )]
    theme: Theme,

    #[arg(short, long, global = true, help = "Plain output without progress spinners")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    #[command(about = "Create and format a region as node 0")]
    Create(CreateCmd),

    #[command(about = "Read a region descriptor without mapping the region")]
    Inspect {
        #[arg(value_name = "REGION")]
        path: PathBuf,

        #[arg(long, help = "Include a hex dump of the descriptor bytes")]
        raw: bool,
    },

    #[command(about = "Set, wait on, or reset a barrier")]
    Barrier(BarrierCmd),

    #[command(about = "Print pool and clock statistics of a region")]
    Stats {
        #[arg(value_name = "REGION")]
        path: PathBuf,

        #[arg(long, default_value_t = 0, help = "Node id to attach as")]
        node: u32,
    },
}

#[derive(Args, Debug)]
struct CreateCmd {
    #[arg(value_name = "REGION")]
    path: PathBuf,

    #[arg(long, default_value_t = 1, help = "Number of node processes in the job")]
    nodes: u32,

    #[arg(long, default_value_t = 1, help = "Worker cores per node")]
    cores: u32,

    #[arg(long, value_name = "BYTES", help = "Region size (defaults to the configured size)")]
    size: Option<u64>,

    #[arg(long, help = "Label recorded in the descriptor")]
    label: Option<String>,

    #[arg(
        long,
        value_name = "ID",
        help = "Flush the region and signal this barrier once formatted"
    )]
    publish_barrier: Option<u32>,

    #[arg(
        long,
        value_name = "MS",
        help = "Run a flush server for this long before exiting"
    )]
    serve_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct BarrierCmd {
    #[arg(value_name = "REGION")]
    path: PathBuf,

    #[arg(long, default_value_t = 0, help = "Node id to attach as")]
    node: u32,

    #[command(subcommand)]
    op: BarrierOp,
}

#[derive(Subcommand, Debug)]
enum BarrierOp {
    #[command(about = "Signal a barrier")]
    Set {
        #[arg(value_name = "ID")]
        id: u32,
    },
    #[command(about = "Block until a barrier is signalled")]
    Wait {
        #[arg(value_name = "ID")]
        id: u32,

        #[arg(long, value_name = "MS", help = "Give up after this many milliseconds")]
        timeout_ms: Option<u64>,
    },
    #[command(about = "Clear a barrier")]
    Reset {
        #[arg(value_name = "ID")]
        id: u32,
    },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Serialize)]
struct CreateReport {
    path: PathBuf,
    descriptor: DescriptorSnapshot,
    published_barrier: Option<u32>,
    server: Option<FlushServerStats>,
}

#[derive(Serialize)]
struct InspectReport {
    path: PathBuf,
    file_len: u64,
    valid: bool,
    descriptor: DescriptorSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw: Option<String>,
}

#[derive(Serialize)]
struct BarrierReport {
    id: u32,
    action: &'static str,
    set: bool,
    waited_ms: Option<u64>,
}

#[derive(Serialize)]
struct StatsReport {
    path: PathBuf,
    label: String,
    #[serde(flatten)]
    region: RegionStats,
    barriers_set: Vec<u32>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_tracing();
    let config = RegionConfig::load_or_default(cli.config.as_deref())?;
    let ui = Ui::new(cli.theme, cli.quiet || cli.format == OutputFormat::Json);

    match cli.command {
        Command::Create(cmd) => {
            let report = create(&ui, config, cmd)?;
            emit(cli.format, &report, || print_create(&ui, &report))
        }
        Command::Inspect { path, raw } => {
            let report = inspect(&path, raw)?;
            emit(cli.format, &report, || print_inspect(&ui, &report))
        }
        Command::Barrier(cmd) => {
            let report = barrier(&ui, config, cmd)?;
            emit(cli.format, &report, || print_barrier(&ui, &report))
        }
        Command::Stats { path, node } => {
            let region = open_region(&path, node, config)?;
            let mut barriers_set = Vec::new();
            for id in 0..BARRIER_SLOTS as u32 {
                if region.barrier_is_set(id)? {
                    barriers_set.push(id);
                }
            }
            let report = StatsReport {
                path,
                label: region.snapshot()?.label,
                region: region.stats()?,
                barriers_set,
            };
            emit(cli.format, &report, || print_stats(&ui, &report))
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn create(ui: &Ui, config: RegionConfig, cmd: CreateCmd) -> Result<CreateReport, Box<dyn Error>> {
    let mut config = RegionConfig {
        path: cmd.path.clone(),
        ..config
    };
    if let Some(size) = cmd.size {
        config.size = size;
    }
    if let Some(label) = cmd.label {
        config.label = label;
    }
    let topology = Topology::new(NodeId(0), cmd.nodes, cmd.cores)?;
    let region = Region::create(&topology, &config)?;

    if let Some(id) = cmd.publish_barrier {
        let waiting = ui.waiting(format!("publishing startup barrier {id}"));
        region.publish_startup(id)?;
        waiting.done();
    }

    let server = match cmd.serve_ms {
        Some(ms) => {
            let server = FlushServer::start(&region, config.server.to_server_config())?;
            let waiting = ui.waiting(format!("serving flushes for {ms}ms"));
            thread::sleep(Duration::from_millis(ms));
            waiting.done();
            Some(server.stop())
        }
        None => None,
    };

    Ok(CreateReport {
        path: cmd.path,
        descriptor: region.snapshot()?,
        published_barrier: cmd.publish_barrier,
        server,
    })
}

fn inspect(path: &Path, raw: bool) -> Result<InspectReport, Box<dyn Error>> {
    let io = StdFileIo::open_read_only(path)?;
    let file_len = io.len()?;
    if file_len < DESCRIPTOR_LEN as u64 {
        return Err(format!(
            "{} is {file_len} bytes, too short to hold a region descriptor",
            path.display()
        )
        .into());
    }
    let mut bytes = [0u8; DESCRIPTOR_LEN];
    io.read_at(0, &mut bytes)?;
    let descriptor = DescriptorSnapshot::from_bytes(&bytes)?;
    Ok(InspectReport {
        path: path.to_path_buf(),
        file_len,
        valid: descriptor.is_valid(),
        descriptor,
        raw: raw.then(|| hex::encode(bytes)),
    })
}

fn barrier(ui: &Ui, config: RegionConfig, cmd: BarrierCmd) -> Result<BarrierReport, Box<dyn Error>> {
    let region = open_region(&cmd.path, cmd.node, config)?;
    let report = match cmd.op {
        BarrierOp::Set { id } => {
            region.set_barrier(id)?;
            BarrierReport {
                id,
                action: "set",
                set: true,
                waited_ms: None,
            }
        }
        BarrierOp::Reset { id } => {
            region.reset_barrier(id)?;
            BarrierReport {
                id,
                action: "reset",
                set: false,
                waited_ms: None,
            }
        }
        BarrierOp::Wait { id, timeout_ms } => {
            let waiting = ui.waiting(format!("waiting on barrier {id}"));
            match timeout_ms {
                Some(ms) => region.wait_barrier_timeout(id, Duration::from_millis(ms))?,
                None => region.wait_barrier(id)?,
            }
            let waited = waiting.done();
            BarrierReport {
                id,
                action: "wait",
                set: true,
                waited_ms: Some(waited.as_millis() as u64),
            }
        }
    };
    Ok(report)
}

/// Attaches to an existing region, taking its topology from the descriptor
/// and its size from the backing file.
fn open_region(path: &Path, node: u32, config: RegionConfig) -> Result<Region, Box<dyn Error>> {
    let report = inspect(path, false)?;
    if !report.valid {
        return Err(format!("{} holds no published region descriptor", path.display()).into());
    }
    let descriptor = report.descriptor;
    let topology = Topology::new(NodeId(node), descriptor.node_count, descriptor.core_count)?;
    let config = RegionConfig {
        path: path.to_path_buf(),
        size: report.file_len,
        ..config
    };
    Ok(Region::attach(&topology, &config)?)
}

fn emit<T, F>(format: OutputFormat, value: &T, printer: F) -> Result<(), Box<dyn Error>>
where
    T: Serialize,
    F: FnOnce(),
{
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Text => printer(),
    }
    Ok(())
}

fn print_descriptor(ui: &Ui, descriptor: &DescriptorSnapshot) {
    ui.fields(
        "descriptor",
        &[
            ("magic", format!("{:#018x}", descriptor.magic)),
            ("version", descriptor.version.to_string()),
            (
                "topology",
                format!("{} nodes x {} cores", descriptor.node_count, descriptor.core_count),
            ),
            ("capacity", format_bytes(descriptor.capacity)),
            ("data offset", format!("{:#x}", descriptor.data_offset)),
            ("label", descriptor.label.clone()),
            ("clock", descriptor.clock.to_string()),
        ],
    );
}

fn print_create(ui: &Ui, report: &CreateReport) {
    ui.done(&format!("created region at {}", report.path.display()));
    print_descriptor(ui, &report.descriptor);
    if let Some(id) = report.published_barrier {
        ui.done(&format!("startup barrier {id} signalled"));
    }
    if let Some(server) = &report.server {
        ui.fields(
            "flush server",
            &[
                ("passes", server.flushes.to_string()),
                ("written back", format_bytes(server.bytes_flushed)),
                ("clock ticks", server.clock_publishes.to_string()),
                ("errors", server.errors.to_string()),
            ],
        );
    }
}

fn print_inspect(ui: &Ui, report: &InspectReport) {
    if !report.valid {
        ui.alert(&format!(
            "{} has magic {:#018x}, not a published region",
            report.path.display(),
            report.descriptor.magic
        ));
    }
    ui.fields(
        "backing file",
        &[
            ("path", report.path.display().to_string()),
            ("length", format_bytes(report.file_len)),
        ],
    );
    print_descriptor(ui, &report.descriptor);
    if let Some(raw) = &report.raw {
        // Two hex digits per byte, one cache half-line per row.
        let rows = raw
            .as_bytes()
            .chunks(64)
            .enumerate()
            .map(|(i, chunk)| format!("{:04x}  {}", i * 32, String::from_utf8_lossy(chunk)));
        ui.lines("descriptor bytes", rows);
    }
}

fn print_barrier(ui: &Ui, report: &BarrierReport) {
    match report.waited_ms {
        Some(ms) => ui.done(&format!(
            "barrier {} signalled after {}",
            report.id,
            format_ms(Duration::from_millis(ms))
        )),
        None => ui.done(&format!("barrier {} {}", report.id, report.action)),
    }
}

fn print_stats(ui: &Ui, report: &StatsReport) {
    let region = &report.region;
    let pool = &region.pool;
    ui.fields(
        "region",
        &[
            ("path", report.path.display().to_string()),
            ("label", report.label.clone()),
            ("node", region.node.to_string()),
            ("clock", format!("{} (observed {})", region.clock, region.observed_clock)),
            ("pending", format!("{} write ranges", region.pending_writes)),
        ],
    );
    println!();
    ui.gauge("reserved", pool.reserved, pool.capacity);
    ui.gauge("in use  ", pool.in_use, pool.capacity);
    ui.fields(
        "pool",
        &[
            ("allocations", pool.allocations.to_string()),
            ("frees", pool.frees.to_string()),
            ("remaining", format_bytes(pool.remaining)),
        ],
    );
    ui.barrier_row(&report.barriers_set, BARRIER_SLOTS as u32);
}
