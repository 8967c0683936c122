// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{
    collections::HashMap,
    env,
    fs::{self, File},
    io::Write,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
    process,
    str::FromStr,
};

use clap::{Arg, ArgAction, ArgMatches, Command};
use env_logger::Builder;
use log::{debug, warn, LevelFilter};
use serde_derive::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use libstord::{
    engine::{
        AccessMode, CancelToken, DevicePosition, FileRange, ReadOutcome, Record, Selection,
        SessionId, StorageDaemon, VolumeName, WriteRequest, STREAM_FILE_DATA, STREAM_SHA256_DIGEST,
        STREAM_UNIX_ATTRIBUTES,
    },
    stord::{DaemonConfig, ErrorEnum, StordError, StordResult, VERSION},
};

/// Attributes of a backed up file, carried in its attributes record.
#[derive(Debug, Deserialize, Serialize)]
struct FileAttributes {
    path: PathBuf,
    size: u64,
    mode: u32,
    mtime: i64,
}

fn parse_args() -> Command {
    let device = Arg::new("device")
        .long("device")
        .short('d')
        .required(true)
        .help("Device name or media type");
    let volume = Arg::new("volume").required(true).help("Volume name");
    let position = [
        Arg::new("file")
            .long("file")
            .value_parser(clap::value_parser!(u32))
            .default_value("0")
            .help("File of the session start label"),
        Arg::new("block")
            .long("block")
            .value_parser(clap::value_parser!(u32))
            .default_value("0")
            .help("Block of the session start label"),
    ];
    let selection = [
        Arg::new("session")
            .long("session")
            .value_parser(clap::value_parser!(u32))
            .help("Session expected at the start position"),
        Arg::new("files")
            .long("files")
            .action(ArgAction::Append)
            .help("File indexes to read, N or N-M; may be repeated"),
    ];

    Command::new("stord")
        .version(VERSION)
        .about("Storage daemon volume and session tool")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .value_parser(clap::value_parser!(PathBuf))
                .default_value("/etc/stord/stord.json")
                .help("Daemon configuration file"),
        )
        .arg(
            Arg::new("log_level")
                .long("log-level")
                .value_parser(["error", "warn", "info", "debug", "trace"])
                .help("Sets level for generation of log messages"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("label")
                .about("Label a blank volume")
                .arg(device.clone())
                .arg(volume.clone()),
        )
        .subcommand(Command::new("status").about("Show devices, volumes and counters"))
        .subcommand(
            Command::new("backup")
                .about("Write files as one session")
                .arg(device.clone())
                .arg(
                    Arg::new("volume")
                        .long("volume")
                        .help("Volume to start on"),
                )
                .arg(
                    Arg::new("job")
                        .long("job")
                        .default_value("Backup")
                        .help("Job name"),
                )
                .arg(
                    Arg::new("paths")
                        .required(true)
                        .num_args(1..)
                        .value_parser(clap::value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("restore")
                .about("Read a session back into a directory")
                .arg(device.clone())
                .arg(volume.clone())
                .args(position.clone())
                .args(selection.clone())
                .arg(
                    Arg::new("to")
                        .long("to")
                        .required(true)
                        .value_parser(clap::value_parser!(PathBuf))
                        .help("Directory to restore into"),
                ),
        )
        .subcommand(
            Command::new("ls")
                .about("List the files of a session")
                .arg(device.clone())
                .arg(volume.clone())
                .args(position)
                .args(selection),
        )
        .subcommand(
            Command::new("dump")
                .about("Print the blocks of a volume")
                .arg(device)
                .arg(volume)
                .arg(
                    Arg::new("count")
                        .long("count")
                        .value_parser(clap::value_parser!(u32))
                        .default_value("100")
                        .help("Number of blocks to print"),
                )
                .arg(
                    Arg::new("print_bytes")
                        .long("print-bytes")
                        .short('b')
                        .action(ArgAction::SetTrue)
                        .help("Print the bytes of every record"),
                ),
        )
}

/// Configure and initialize the logger.
/// An explicit level applies to this tool and the library; otherwise
/// RUST_LOG is read, and by default only errors are logged.
fn initialize_log(log_level: Option<&String>) {
    let mut builder = Builder::new();
    if let Some(log_level) = log_level {
        let level =
            LevelFilter::from_str(log_level).expect("argument parser only accepts valid log levels");
        builder.filter(Some("stord"), level);
        builder.filter(Some("libstord"), level);
    } else if let Ok(s) = env::var("RUST_LOG") {
        builder.parse_filters(&s);
    }
    builder.init()
}

fn volume_arg(matches: &ArgMatches) -> StordResult<VolumeName> {
    VolumeName::new(
        matches
            .get_one::<String>("volume")
            .expect("'volume' is a mandatory argument"),
    )
}

fn device_arg(matches: &ArgMatches) -> &str {
    matches
        .get_one::<String>("device")
        .expect("'device' is a mandatory argument")
}

fn position_arg(matches: &ArgMatches) -> DevicePosition {
    DevicePosition::new(
        *matches.get_one::<u32>("file").unwrap_or(&0),
        *matches.get_one::<u32>("block").unwrap_or(&0),
    )
}

fn selection_arg(matches: &ArgMatches) -> StordResult<Selection> {
    let files = matches
        .get_many::<String>("files")
        .map(|values| {
            values
                .map(|v| v.parse::<FileRange>())
                .collect::<StordResult<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    Ok(Selection {
        session: matches.get_one::<u32>("session").map(|id| SessionId(*id)),
        ..Default::default()
    }
    .with_files(files))
}

/// Every regular file under `paths`, depth first.
fn collect_files(paths: &[PathBuf]) -> StordResult<Vec<PathBuf>> {
    let mut files = vec![];
    let mut pending: Vec<PathBuf> = paths.iter().rev().cloned().collect();
    while let Some(path) = pending.pop() {
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            let mut entries = fs::read_dir(&path)?
                .map(|entry| entry.map(|e| e.path()))
                .collect::<Result<Vec<_>, _>>()?;
            entries.sort();
            pending.extend(entries.into_iter().rev());
        } else if meta.is_file() {
            files.push(path);
        }
    }
    Ok(files)
}

/// The records of one file: attributes, data in chunks, and a digest.
fn file_records(path: &Path, file_index: i32, chunk: usize) -> Vec<Record> {
    let (meta, data) = match (fs::metadata(path), fs::read(path)) {
        (Ok(meta), Ok(data)) => (meta, data),
        (Err(err), _) | (_, Err(err)) => {
            warn!("skipping {}: {}", path.display(), err);
            return vec![];
        }
    };
    let attrs = FileAttributes {
        path: path.to_owned(),
        size: data.len() as u64,
        mode: meta.mode(),
        mtime: meta.mtime(),
    };
    let attrs = match serde_json::to_vec(&attrs) {
        Ok(attrs) => attrs,
        Err(err) => {
            warn!("skipping {}: {}", path.display(), err);
            return vec![];
        }
    };

    let mut records = vec![Record::new(STREAM_UNIX_ATTRIBUTES, file_index, attrs)];
    records.extend(
        data.chunks(chunk)
            .map(|c| Record::new(STREAM_FILE_DATA, file_index, c.to_vec())),
    );
    records.push(Record::new(
        STREAM_SHA256_DIGEST,
        file_index,
        Sha256::digest(&data).to_vec(),
    ));
    records
}

fn backup(daemon: &StorageDaemon, matches: &ArgMatches) -> StordResult<()> {
    let paths: Vec<PathBuf> = matches
        .get_many::<PathBuf>("paths")
        .expect("'paths' is a mandatory argument")
        .cloned()
        .collect();
    let request = WriteRequest {
        job: matches
            .get_one::<String>("job")
            .cloned()
            .unwrap_or_default(),
        device: device_arg(matches).to_owned(),
        volume: matches
            .get_one::<String>("volume")
            .map(|v| VolumeName::new(v))
            .transpose()?,
    };
    let chunk = daemon.context().block_size();
    let files = collect_files(&paths)?;
    let records = files
        .iter()
        .enumerate()
        .flat_map(|(i, path)| file_records(path, i as i32 + 1, chunk));
    let result = daemon.write_session(&request, records, &CancelToken::new())?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Where a restored file goes: its original path below `to`.
fn restore_path(to: &Path, original: &Path) -> PathBuf {
    to.join(original.strip_prefix("/").unwrap_or(original))
}

fn restore(daemon: &StorageDaemon, matches: &ArgMatches) -> StordResult<()> {
    let to = matches
        .get_one::<PathBuf>("to")
        .expect("'to' is a mandatory argument");
    let mut open: HashMap<i32, (PathBuf, File, Sha256)> = HashMap::new();
    let mut restored = 0;

    let result = daemon.read_selected(
        device_arg(matches),
        &volume_arg(matches)?,
        position_arg(matches),
        &selection_arg(matches)?,
        &CancelToken::new(),
        |record| {
            match record.stream {
                STREAM_UNIX_ATTRIBUTES => {
                    let attrs: FileAttributes = serde_json::from_slice(&record.data)?;
                    let path = restore_path(to, &attrs.path);
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    let file = File::create(&path)?;
                    open.insert(record.file_index, (path, file, Sha256::new()));
                }
                STREAM_FILE_DATA => {
                    if let Some((_, file, digest)) = open.get_mut(&record.file_index) {
                        file.write_all(&record.data)?;
                        digest.update(&record.data);
                    }
                }
                STREAM_SHA256_DIGEST => {
                    if let Some((path, file, digest)) = open.remove(&record.file_index) {
                        file.sync_all()?;
                        if digest.finalize().as_slice() != record.data.as_slice() {
                            return Err(StordError::Engine(
                                ErrorEnum::CorruptBlock,
                                format!("digest mismatch for {}", path.display()),
                            ));
                        }
                        restored += 1;
                    }
                }
                other => debug!("ignoring record of stream {}", other),
            }
            Ok(())
        },
    )?;
    println!(
        "restored {} files ({} bytes) of job \"{}\" from {:?}{}",
        restored,
        result.bytes,
        result.job,
        result.volumes,
        if result.complete { "" } else { ", session incomplete" }
    );
    Ok(())
}

fn list(daemon: &StorageDaemon, matches: &ArgMatches) -> StordResult<()> {
    let selection = selection_arg(matches)?.with_streams(vec![STREAM_UNIX_ATTRIBUTES]);
    daemon.read_selected(
        device_arg(matches),
        &volume_arg(matches)?,
        position_arg(matches),
        &selection,
        &CancelToken::new(),
        |record| {
            if record.stream == STREAM_UNIX_ATTRIBUTES {
                let attrs: FileAttributes = serde_json::from_slice(&record.data)?;
                println!(
                    "{:>6} {:o} {:>12} {}",
                    record.file_index,
                    attrs.mode,
                    attrs.size,
                    attrs.path.display()
                );
            }
            Ok(())
        },
    )?;
    Ok(())
}

fn dump(daemon: &StorageDaemon, matches: &ArgMatches) -> StordResult<()> {
    let volume = volume_arg(matches)?;
    let count = *matches.get_one::<u32>("count").unwrap_or(&100);
    let print_bytes = matches.get_flag("print_bytes");

    let token = daemon.reserve_device(device_arg(matches), AccessMode::Read, "dump")?;
    let mut dev = token.lock_device()?;
    let session = daemon.context().new_session_id();
    dev.open(session, &volume, AccessMode::Read)?;
    let cancel = CancelToken::new();

    let mut result = Ok(());
    for _ in 0..count {
        let op = cancel.with_timeout(daemon.context().config().io_timeout());
        let (device, block) = dev.parts();
        let pos = device.tell();
        match device.read_block(block, &op) {
            Ok(ReadOutcome::EndOfFile) => println!("{pos}: file mark"),
            Ok(ReadOutcome::EndOfMedium) => {
                println!("{pos}: end of data");
                break;
            }
            Ok(ReadOutcome::Block) => {
                println!(
                    "{}: block {} used {} {}{}",
                    pos,
                    block.number(),
                    block.used(),
                    if block.is_label() { "label" } else { "data" },
                    if block.is_continued() { " continued" } else { "" }
                );
                loop {
                    match block.read_record() {
                        Ok(Some(fragment)) => {
                            println!(
                                "    stream {} index {} {} of {} bytes{}",
                                fragment.stream,
                                fragment.file_index,
                                fragment.data.len(),
                                fragment.remaining,
                                if fragment.continuation { " (continued)" } else { "" }
                            );
                            if print_bytes {
                                println!("{}", pretty_hex::pretty_hex(&fragment.data));
                            }
                        }
                        Ok(None) => break,
                        Err(err) => {
                            result = Err(err);
                            break;
                        }
                    }
                }
            }
            Err(err) => result = Err(err),
        }
        if result.is_err() {
            break;
        }
    }
    dev.release(session);
    result
}

fn run(matches: &ArgMatches) -> StordResult<()> {
    let config_path = matches
        .get_one::<PathBuf>("config")
        .expect("'config' has a default value");
    let daemon = StorageDaemon::new(DaemonConfig::from_file(config_path)?)?;

    let result = match matches.subcommand() {
        Some(("label", sub)) => daemon
            .label_volume(device_arg(sub), &volume_arg(sub)?, &CancelToken::new())
            .map(|label| println!("labeled \"{}\" ({})", label.volume, label.volume_id)),
        Some(("status", _)) => daemon
            .status()
            .and_then(|status| Ok(serde_json::to_string_pretty(&status)?))
            .map(|text| println!("{text}")),
        Some(("backup", sub)) => backup(&daemon, sub),
        Some(("restore", sub)) => restore(&daemon, sub),
        Some(("ls", sub)) => list(&daemon, sub),
        Some(("dump", sub)) => dump(&daemon, sub),
        _ => unreachable!("a subcommand is required"),
    };
    let shutdown = daemon.shutdown();
    result.and(shutdown)
}

fn main() {
    let matches = parse_args().get_matches();
    initialize_log(matches.get_one::<String>("log_level"));

    if let Err(err) = run(&matches) {
        eprintln!("Error encountered: {err}");
        process::exit(1);
    }
}
