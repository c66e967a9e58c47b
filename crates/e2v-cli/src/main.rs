#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use e2v::dump::{dump_dirent, dump_group_descriptors, dump_inode, dump_superblock};
use e2v::{Ext2DirEntry, Ext2Fs, InodeNumber, OpenOptions, Session};
use serde::Serialize;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::Path;

#[derive(Debug, Serialize)]
struct InspectOutput {
    filesystem: &'static str,
    revision: u32,
    block_size: u32,
    blocks_count: u32,
    free_blocks_count: u32,
    inodes_count: u32,
    free_inodes_count: u32,
    inode_size: u16,
    groups_count: u32,
    volume_name: String,
    uuid: String,
    feature_compat: String,
    feature_incompat: String,
    feature_ro_compat: String,
}

fn main() {
    if let Err(error) = run() {
        eprintln!("error: {error:#}");
        std::process::exit(1);
    }
}

/// Split global `--no-validate` / `--cache N` flags from the rest.
fn take_open_options(args: Vec<String>) -> Result<(OpenOptions, Vec<String>)> {
    let mut options = OpenOptions::default();
    let mut rest = Vec::with_capacity(args.len());
    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--no-validate" => options.skip_validation = true,
            "--cache" => {
                let n = iter.next().context("--cache requires a block count")?;
                options.cache_blocks =
                    Some(n.parse().with_context(|| format!("invalid --cache value: {n}"))?);
            }
            _ => rest.push(arg),
        }
    }
    Ok((options, rest))
}

fn run() -> Result<()> {
    let (options, args) = take_open_options(env::args().skip(1).collect())?;
    let Some(command) = args.first().map(String::as_str) else {
        print_usage();
        return Ok(());
    };
    let rest = &args[1..];

    match command {
        "inspect" => {
            let Some(path) = rest.first() else {
                bail!("inspect requires a path argument");
            };
            let json = rest.iter().any(|arg| arg == "--json");
            inspect(Path::new(path), &options, json)
        }
        "ls" => {
            let Some(image) = rest.first() else {
                bail!("ls requires <image-path> [path]");
            };
            let dir = rest.get(1).map_or("/", String::as_str);
            let session = open_session(Path::new(image), &options)?;
            let mut out = io::stdout().lock();
            list(&session, dir, &mut out)
        }
        "cat" => {
            let (Some(image), Some(path)) = (rest.first(), rest.get(1)) else {
                bail!("cat requires <image-path> <path> [--max-bytes N]");
            };
            let max = parse_max_bytes(&rest[2..])?;
            let session = open_session(Path::new(image), &options)?;
            let mut out = io::stdout().lock();
            cat(&session, path, max, &mut out)
        }
        "dump" => {
            let Some(image) = rest.first() else {
                bail!("dump requires <image-path> superblock|groups|inode <n>");
            };
            let session = open_session(Path::new(image), &options)?;
            print!("{}", dump(&session, &rest[1..])?);
            Ok(())
        }
        "shell" => {
            let Some(image) = rest.first() else {
                bail!("shell requires an image path");
            };
            let mut session = open_session(Path::new(image), &options)?;
            let stdin = io::stdin().lock();
            let mut out = io::stdout().lock();
            shell(&mut session, stdin, &mut out)
        }
        "--help" | "-h" | "help" => {
            print_usage();
            Ok(())
        }
        _ => {
            print_usage();
            bail!("unknown command: {command}")
        }
    }
}

fn print_usage() {
    println!("e2v-cli\n");
    println!("USAGE:");
    println!("  e2v-cli [--no-validate] [--cache N] <command> ...\n");
    println!("  e2v-cli inspect <image-path> [--json]");
    println!("  e2v-cli ls <image-path> [path]");
    println!("  e2v-cli cat <image-path> <path> [--max-bytes N]");
    println!("  e2v-cli dump <image-path> superblock|groups|inode <n>");
    println!("  e2v-cli shell <image-path>");
}

fn parse_max_bytes(args: &[String]) -> Result<Option<usize>> {
    match args {
        [] => Ok(None),
        [flag, n] if flag == "--max-bytes" => Ok(Some(
            n.parse()
                .with_context(|| format!("invalid --max-bytes value: {n}"))?,
        )),
        _ => bail!("unexpected arguments: {}", args.join(" ")),
    }
}

fn open_session(path: &Path, options: &OpenOptions) -> Result<Session> {
    Session::open_with_options(path, options)
        .with_context(|| format!("failed to open ext2 image: {}", path.display()))
}

fn inspect(path: &Path, options: &OpenOptions, json: bool) -> Result<()> {
    let fs = Ext2Fs::open_with_options(path, options)
        .with_context(|| format!("failed to read ext2 metadata in {}", path.display()))?;
    let sb = fs.superblock();

    let output = InspectOutput {
        filesystem: "ext2",
        revision: sb.rev_level,
        block_size: sb.block_size,
        blocks_count: sb.blocks_count,
        free_blocks_count: sb.free_blocks_count,
        inodes_count: sb.inodes_count,
        free_inodes_count: sb.free_inodes_count,
        inode_size: sb.inode_size,
        groups_count: fs.groups_count(),
        volume_name: sb.volume_name.clone(),
        uuid: hex::encode(sb.uuid),
        feature_compat: sb.feature_compat.to_string(),
        feature_incompat: sb.feature_incompat.to_string(),
        feature_ro_compat: sb.feature_ro_compat.to_string(),
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("serialize output")?
        );
    } else {
        println!("ext2view inspector");
        println!("filesystem: {}", output.filesystem);
        println!("revision: {}", output.revision);
        println!("block_size: {}", output.block_size);
        println!(
            "blocks_count: {} ({} free)",
            output.blocks_count, output.free_blocks_count
        );
        println!(
            "inodes_count: {} ({} free)",
            output.inodes_count, output.free_inodes_count
        );
        println!("inode_size: {}", output.inode_size);
        println!("groups_count: {}", output.groups_count);
        println!("volume_name: {}", output.volume_name);
        println!("uuid: {}", output.uuid);
        println!(
            "features: compat={} incompat={} ro_compat={}",
            output.feature_compat, output.feature_incompat, output.feature_ro_compat
        );
    }

    Ok(())
}

fn format_entry(entry: &Ext2DirEntry) -> String {
    format!(
        "{} {:>8} {}",
        entry.file_type.tag(),
        entry.inode,
        entry.name_str()
    )
}

fn list(session: &Session, path: &str, out: &mut impl Write) -> Result<()> {
    for entry in session.list(path)? {
        writeln!(out, "{}", format_entry(&entry))?;
    }
    Ok(())
}

fn cat(session: &Session, path: &str, max: Option<usize>, out: &mut impl Write) -> Result<()> {
    let data = session.cat(path, max)?;
    out.write_all(&data)?;
    out.flush()?;
    Ok(())
}

fn dump(session: &Session, args: &[String]) -> Result<String> {
    let fs = session.fs();
    match args {
        [what] if what == "superblock" => Ok(dump_superblock(fs.superblock())),
        [what] if what == "groups" => Ok(dump_group_descriptors(fs.group_descriptors())),
        [what, n] if what == "inode" => {
            let ino: u64 = n
                .parse()
                .with_context(|| format!("invalid inode number: {n}"))?;
            let inode = fs.read_inode(InodeNumber(ino))?;
            Ok(dump_inode(&inode))
        }
        [what, path] if what == "dirent" => {
            let entries = session.list(path)?;
            Ok(entries.iter().map(dump_dirent).collect())
        }
        _ => bail!("usage: dump superblock|groups|inode <n>|dirent <dir>"),
    }
}

const SHELL_HELP: &str = "\
commands:
  help                         show this message
  exit                         leave the shell
  pwd                          print the current directory
  ls [path]                    list a directory (default: current)
  cd <path>                    change directory
  cat <path> [n]               print up to n bytes of a file (default 4096)
  dump superblock              print the superblock
  dump groups                  print the block group descriptors
  dump inode <n>               print inode n
  dump dirent <dir>            print every entry of a directory
";

/// Run one shell line. Returns `Ok(false)` when the shell should exit.
fn shell_command(session: &mut Session, line: &str, out: &mut impl Write) -> Result<bool> {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["exit" | "quit"] => return Ok(false),
        ["help"] => out.write_all(SHELL_HELP.as_bytes())?,
        ["pwd"] => writeln!(out, "{}", session.cwd())?,
        ["ls"] => list(session, "", out)?,
        ["ls", path] => list(session, path, out)?,
        ["cd"] => {
            session.change_directory("/")?;
        }
        ["cd", path] => {
            session.change_directory(path)?;
        }
        ["cat", path] => {
            cat(session, path, None, out)?;
            writeln!(out)?;
        }
        ["cat", path, n] => {
            let max = n.parse().with_context(|| format!("invalid byte count: {n}"))?;
            cat(session, path, Some(max), out)?;
            writeln!(out)?;
        }
        ["dump", rest @ ..] => {
            let args: Vec<String> = rest.iter().map(|s| (*s).to_owned()).collect();
            out.write_all(dump(session, &args)?.as_bytes())?;
        }
        [other, ..] => writeln!(out, "unknown command: {other} (try `help`)")?,
    }
    Ok(true)
}

fn shell(session: &mut Session, input: impl BufRead, out: &mut impl Write) -> Result<()> {
    write!(out, "{}> ", session.cwd())?;
    out.flush()?;
    for line in input.lines() {
        let line = line.context("read command")?;
        match shell_command(session, &line, out) {
            Ok(true) => {}
            Ok(false) => return Ok(()),
            Err(error) => writeln!(out, "error: {error:#}")?,
        }
        write!(out, "{}> ", session.cwd())?;
        out.flush()?;
    }
    writeln!(out)?;
    Ok(())
}
