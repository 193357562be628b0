use std::{error::Error, process, sync::Arc};

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use log::{error, info, warn};

use fsck_bio::{
    bio::{BioConfig, BlockDevice, BufFlags, DirtyReleasePolicy, FsckSb, BLOCK_CACHE_SIZE, DEFAULT_BLOCK_SIZE},
    device::BlockFile,
    logger,
};

// fsck 约定的退出码
const EXIT_OK: i32 = 0;
const EXIT_CORRECTED: i32 = 1;
const EXIT_UNCORRECTED: i32 = 4;
const EXIT_OPERATIONAL: i32 = 8;

#[derive(Default)]
struct ScanReport {
    readable: u64,
    unreadable: Vec<u64>,
    zeroed: u64,
}

fn cli() -> Command {
    Command::new("fsck-bio")
        .about("Scan a filesystem image block by block through the fsck buffer layer")
        .arg(
            Arg::new("device")
                .short('d')
                .long("device")
                .required(true)
                .help("Block device or image file to check"),
        )
        .arg(
            Arg::new("block-size")
                .short('b')
                .long("block-size")
                .value_parser(value_parser!(usize))
                .help("Filesystem block size in bytes [default: 4096]"),
        )
        .arg(
            Arg::new("cache")
                .short('c')
                .long("cache")
                .value_parser(value_parser!(usize))
                .help("Resident buffer limit, 0 keeps every block [default: 1024]"),
        )
        .arg(
            Arg::new("no")
                .short('n')
                .long("no")
                .action(ArgAction::SetTrue)
                .help("Open the device read-only and never write"),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .action(ArgAction::SetTrue)
                .conflicts_with("lenient")
                .help("Fail when a dirty buffer is released"),
        )
        .arg(
            Arg::new("lenient")
                .long("lenient")
                .action(ArgAction::SetTrue)
                .help("Only warn when a dirty buffer is released"),
        )
        .arg(
            Arg::new("zero-bad")
                .long("zero-bad")
                .action(ArgAction::SetTrue)
                .help("Overwrite unreadable blocks with zeros"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count)
                .help("Increase log verbosity"),
        )
}

fn main() {
    let matches = cli().get_matches();
    let level = logger::level_from_verbosity(matches.get_count("verbose"));
    if let Err(e) = logger::init(level) {
        eprintln!("logger: {}", e);
    }

    let code = match run(&matches) {
        Ok(report) => {
            println!(
                "{} blocks readable, {} unreadable, {} zeroed",
                report.readable,
                report.unreadable.len(),
                report.zeroed
            );
            if report.unreadable.len() as u64 > report.zeroed {
                EXIT_UNCORRECTED
            } else if report.zeroed > 0 {
                EXIT_CORRECTED
            } else {
                EXIT_OK
            }
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("fsck-bio: {}", e);
            EXIT_OPERATIONAL
        }
    };
    process::exit(code);
}

fn run(matches: &ArgMatches) -> Result<ScanReport, Box<dyn Error>> {
    let path = matches
        .get_one::<String>("device")
        .ok_or("no device given")?;
    let block_size = matches
        .get_one::<usize>("block-size")
        .copied()
        .unwrap_or(DEFAULT_BLOCK_SIZE);
    let read_only = matches.get_flag("no");
    let zero_bad = matches.get_flag("zero-bad");
    if zero_bad && read_only {
        warn!("--zero-bad ignored in read-only mode");
    }

    let config = BioConfig {
        cache_capacity: matches
            .get_one::<usize>("cache")
            .copied()
            .unwrap_or(BLOCK_CACHE_SIZE),
        dirty_release: if matches.get_flag("strict") {
            DirtyReleasePolicy::Strict
        } else if matches.get_flag("lenient") {
            DirtyReleasePolicy::Warn
        } else {
            DirtyReleasePolicy::default()
        },
        read_only,
    };

    let device = Arc::new(BlockFile::open(path, block_size, !read_only)?);
    if device.block_count() == 0 {
        return Err(format!("{}: device holds no blocks", path).into());
    }
    let mut sb = FsckSb::new(device, config);
    let mut report = ScanReport::default();

    for block_id in 0..sb.block_count() {
        let (handle, err) = match sb.get_and_read_buf(block_id, BufFlags::NONE) {
            Ok(handle) => {
                report.readable += 1;
                sb.relse_buf(handle)?;
                continue;
            }
            Err(failed) => failed.into_parts(),
        };
        warn!("{}", err);
        report.unreadable.push(block_id);

        if let Some(handle) = handle {
            if zero_bad && !read_only {
                handle.modify(|data| data.fill(0));
                match sb.write_buf(&handle, BufFlags::WAIT) {
                    Ok(()) => report.zeroed += 1,
                    Err(e) => {
                        error!("{}", e);
                        sb.discard_buf(&handle);
                    }
                }
            }
            sb.relse_buf(handle)?;
        }
        if err.is_fatal() {
            return Err(err.into());
        }
    }

    let stats = sb.close()?;
    info!("{:?}", stats);
    if !report.unreadable.is_empty() {
        info!("unreadable blocks: {:?}", report.unreadable);
    }
    Ok(report)
}
