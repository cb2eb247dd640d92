use clap::{Args, Parser, Subcommand};
use clap_num::maybe_hex;
use qcow2_bdev::dev::BdevParams;
use qcow2_bdev::error::BdevResult;
use qcow2_bdev::utils::{qcow2_connect_file, qcow2_create_file};
use std::path::PathBuf;
use tokio::runtime::Builder;

#[derive(Args, Debug)]
pub struct FormatArgs {
    /// virtual size, unit is MB
    #[clap(long, short = 's', default_value_t = 64)]
    size: u32,

    /// image path
    file: PathBuf,
}

#[derive(Args, Debug)]
pub struct InfoArgs {
    /// image path
    file: PathBuf,
}

#[derive(Args, Debug)]
pub struct MapArgs {
    /// virtual byte address
    #[clap(short, long, value_parser=maybe_hex::<u64>)]
    addr: u64,

    /// image path
    file: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Format a file as an empty image
    Format(FormatArgs),

    /// Show image geometry and allocation statistics
    Info(InfoArgs),

    /// Translate a virtual byte address into a host offset
    Map(MapArgs),
}

#[derive(Parser)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

async fn cmd_format(args: &FormatArgs) -> BdevResult<()> {
    let size = (args.size as u64) << 20;
    let dev = qcow2_create_file(&args.file, size, &BdevParams::default()).await?;
    dev.disconnect().await?;
    println!("{}: formatted, virtual size {} MB", args.file.display(), args.size);
    Ok(())
}

async fn cmd_info(args: &InfoArgs) -> BdevResult<()> {
    let dev = qcow2_connect_file(&args.file, &BdevParams::default()).await?;
    let info = dev.get_info().await?;
    let geo = &dev.info;

    println!("{}:", args.file.display());
    println!("\tvirtual size\t\t{} bytes ({} sectors)", geo.virtual_size(), info.size_sectors);
    println!("\tcluster size\t\t{} (cluster_bits {})", geo.cluster_size(), geo.cluster_bits);
    println!("\tl1 entries\t\t{} at {:#x}", geo.l1_size, geo.l1_table_offset);
    println!("\trefcount table\t\tat {:#x}", geo.refcount_table_offset);
    println!("\tallocated clusters\t{}", dev.next_cluster());
    dev.disconnect().await?;
    Ok(())
}

async fn cmd_map(args: &MapArgs) -> BdevResult<()> {
    let dev = qcow2_connect_file(&args.file, &BdevParams::default()).await?;
    match dev.map_virtual(args.addr).await? {
        Some(host) => println!("{:#x} -> host offset {:#x}", args.addr, host),
        None => println!("{:#x} -> unallocated", args.addr),
    }
    dev.disconnect().await?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    env_logger::builder()
        .format_target(false)
        .format_timestamp(None)
        .init();

    let rt = Builder::new_current_thread().enable_all().build().unwrap();
    rt.block_on(async {
        match &cli.command {
            Commands::Format(args) => cmd_format(args).await.unwrap(),
            Commands::Info(args) => cmd_info(args).await.unwrap(),
            Commands::Map(args) => cmd_map(args).await.unwrap(),
        }
    });
}
