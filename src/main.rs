use clap::Parser;
use color_eyre::Result;
use std::fs::OpenOptions;

use nbd_server::{ExportInfo, FileBackendFactory, MemBackendFactory, Server};

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Args {
    #[clap(long)]
    no_create: bool,

    #[clap(short, long, default_value = "127.0.0.1:10809")]
    addr: String,

    #[clap(long, default_value = "default")]
    export: String,

    #[clap(long, default_value = "default export")]
    description: String,

    #[clap(long, default_value_t = 4096)]
    block_size: u32,

    #[clap(short, long, default_value_t = 10, help = "export size in MiB")]
    size: usize,

    #[clap(short, long, help = "serve a fresh in-memory export per client")]
    mem: bool,

    #[clap(default_value = "disk.img")]
    filename: String,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let args = Args::parse();
    let create = !args.no_create;
    let size_bytes = args.size as u64 * 1024 * 1024;

    let info = ExportInfo {
        name: args.export,
        description: args.description,
        size: size_bytes,
        block_size: args.block_size,
    };

    if args.mem {
        Server::new(MemBackendFactory::new(info)).start(args.addr.as_str())?;
        return Ok(());
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(args.filename)?;

    file.set_len(size_bytes)?;

    let factory = FileBackendFactory::new(file, info.name, info.description, info.block_size)?;
    Server::new(factory).start(args.addr.as_str())?;
    Ok(())
}
