use clap::{Arg, Command};

use chunkfs::client::FsClient;
use chunkfs::config::load_config;
use chunkfs::util::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let matches = Command::new("Client")
        .version("1.0")
        .about("chunkfs command-line client")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .default_value("config.toml")
                .help("Path to the configuration file"),
        )
        .subcommand(
            Command::new("create")
                .about("Create an empty file")
                .arg(Arg::new("path").required(true)),
        )
        .subcommand(
            Command::new("write")
                .about("Write bytes at an offset")
                .arg(Arg::new("path").required(true))
                .arg(Arg::new("offset").required(true))
                .arg(Arg::new("data").required(true)),
        )
        .subcommand(
            Command::new("read")
                .about("Read a byte range")
                .arg(Arg::new("path").required(true))
                .arg(Arg::new("offset").required(true))
                .arg(Arg::new("length").required(true)),
        )
        .subcommand(
            Command::new("append")
                .about("Atomically append a record")
                .arg(Arg::new("path").required(true))
                .arg(Arg::new("record").required(true)),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete a file")
                .arg(Arg::new("path").required(true)),
        )
        .subcommand(
            Command::new("rename")
                .about("Rename a file")
                .arg(Arg::new("old").required(true))
                .arg(Arg::new("new").required(true)),
        )
        .subcommand(
            Command::new("snapshot")
                .about("Copy-on-write snapshot of a file")
                .arg(Arg::new("src").required(true))
                .arg(Arg::new("dst").required(true)),
        )
        .subcommand(
            Command::new("ls")
                .about("List files under a prefix")
                .arg(Arg::new("prefix").default_value("/")),
        )
        .subcommand(
            Command::new("stat")
                .about("Show file metadata")
                .arg(Arg::new("path").required(true)),
        )
        .get_matches();

    let config = load_config(matches.get_one::<String>("config").unwrap())
        .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.to_string().into() })?;
    let _log_guard = init_tracing(
        &config.common.log_level,
        &config.common.log_output,
        &config.client.log_path,
    );

    let mut client = FsClient::connect(config.common, config.client).await?;

    match matches.subcommand() {
        Some(("create", sub)) => {
            let path = sub.get_one::<String>("path").unwrap();
            client.create(path).await?;
            println!("Created '{}'", path);
        }
        Some(("write", sub)) => {
            let path = sub.get_one::<String>("path").unwrap();
            let offset: u64 = sub.get_one::<String>("offset").unwrap().parse()?;
            let data = sub.get_one::<String>("data").unwrap();
            client.write(path, offset, data.as_bytes()).await?;
            println!("Wrote {} bytes to '{}' at offset {}", data.len(), path, offset);
        }
        Some(("read", sub)) => {
            let path = sub.get_one::<String>("path").unwrap();
            let offset: u64 = sub.get_one::<String>("offset").unwrap().parse()?;
            let length: u64 = sub.get_one::<String>("length").unwrap().parse()?;
            let bytes = client.read(path, offset, length).await?;
            println!("{}", String::from_utf8_lossy(&bytes));
        }
        Some(("append", sub)) => {
            let path = sub.get_one::<String>("path").unwrap();
            let record = sub.get_one::<String>("record").unwrap();
            let offset = client.append(path, record.as_bytes()).await?;
            println!("Appended {} bytes at offset {}", record.len(), offset);
        }
        Some(("delete", sub)) => {
            let path = sub.get_one::<String>("path").unwrap();
            client.delete(path).await?;
            println!("Deleted '{}'", path);
        }
        Some(("rename", sub)) => {
            let old = sub.get_one::<String>("old").unwrap();
            let new = sub.get_one::<String>("new").unwrap();
            client.rename(old, new).await?;
            println!("Renamed '{}' to '{}'", old, new);
        }
        Some(("snapshot", sub)) => {
            let src = sub.get_one::<String>("src").unwrap();
            let dst = sub.get_one::<String>("dst").unwrap();
            client.snapshot(src, dst).await?;
            println!("Snapshotted '{}' into '{}'", src, dst);
        }
        Some(("ls", sub)) => {
            let prefix = sub.get_one::<String>("prefix").unwrap();
            for path in client.list(prefix).await? {
                println!("{}", path);
            }
        }
        Some(("stat", sub)) => {
            let path = sub.get_one::<String>("path").unwrap();
            let info = client.file_info(path).await?;
            println!(
                "{}: {} bytes, {} chunk(s), created {}, modified {}",
                path,
                info.size,
                info.chunk_handles.len(),
                info.created_at,
                info.modified_at
            );
        }
        _ => {
            eprintln!(
                "Usage: client <create|write|read|append|delete|rename|snapshot|ls|stat> [args]"
            );
        }
    }

    Ok(())
}
