use clap::{value_parser, Arg, ArgMatches, Command};
use hitsz_logfs::{BlockDevice, FileDisk, FileKind, FileSystem, FsError};
use log::info;
use std::io::Write;
use std::process::ExitCode;
use std::sync::Arc;

fn cli() -> Command {
    let path = || Arg::new("path").required(true).help("absolute path inside the image");
    Command::new("hitsz-logfs")
        .about("Inspect and edit a logging file system image")
        .arg(Arg::new("image").required(true).help("image file on the host"))
        .arg(
            Arg::new("offset")
                .long("offset")
                .value_parser(value_parser!(usize))
                .default_value("0")
                .help("first block of the file system inside the image"),
        )
        .subcommand_required(true)
        .subcommand(
            Command::new("mkfs")
                .about("create an empty file system")
                .arg(
                    Arg::new("blocks")
                        .long("blocks")
                        .value_parser(value_parser!(usize))
                        .default_value("2000"),
                )
                .arg(
                    Arg::new("inodes")
                        .long("inodes")
                        .value_parser(value_parser!(usize))
                        .default_value("200"),
                ),
        )
        .subcommand(
            Command::new("ls")
                .about("list a directory")
                .arg(Arg::new("path").default_value("/")),
        )
        .subcommand(Command::new("cat").about("print a file").arg(path()))
        .subcommand(
            Command::new("put")
                .about("copy a host file into the image")
                .arg(Arg::new("host").required(true))
                .arg(path()),
        )
        .subcommand(Command::new("mkdir").about("create a directory").arg(path()))
        .subcommand(Command::new("rm").about("remove a file or an empty directory").arg(path()))
        .subcommand(Command::new("stat").about("show an inode").arg(path()))
}

fn main() -> ExitCode {
    env_logger::init();
    match run(cli().get_matches()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("hitsz-logfs: {e}");
            ExitCode::FAILURE
        }
    }
}

fn path_arg<'a>(matches: &'a ArgMatches, name: &str) -> &'a str {
    matches.get_one::<String>(name).map(String::as_str).unwrap_or("/")
}

fn run(matches: ArgMatches) -> Result<(), FsError> {
    let image = path_arg(&matches, "image");
    let offset = matches.get_one::<usize>("offset").copied().unwrap_or(0);

    let (name, sub) = matches.subcommand().ok_or_else(|| FsError::InvalidPath("no command".into()))?;
    if name == "mkfs" {
        let blocks = sub.get_one::<usize>("blocks").copied().unwrap_or(2000);
        let inodes = sub.get_one::<usize>("inodes").copied().unwrap_or(200);
        let disk: Arc<dyn BlockDevice> = Arc::new(FileDisk::create(image, offset, blocks)?);
        let fs = FileSystem::format(disk, blocks, inodes)?;
        info!("mkfs: {image} {:?}", fs.super_blk());
        return Ok(());
    }

    let disk: Arc<dyn BlockDevice> = Arc::new(FileDisk::open(image, offset)?);
    let fs = FileSystem::mount(disk)?;
    let path = path_arg(sub, "path");
    match name {
        "ls" => {
            let ctx = fs.begin_op();
            let dir = fs.open(&ctx, path);
            fs.end_op(ctx);
            let dir = dir?;
            let entries = fs.read_dir(&dir);
            for (entry, inum) in entries.iter().flatten() {
                let ip = fs.inodes().get(*inum);
                let stat = fs.stat(&ip);
                println!("{:<14} {:>5} {:?} {}", entry, inum, stat.kind, stat.size);
                fs.close(ip);
            }
            fs.close(dir);
            entries.map(|_| ())
        }
        "cat" => {
            let ctx = fs.begin_op();
            let ip = fs.open(&ctx, path);
            fs.end_op(ctx);
            let ip = ip?;
            let mut buf = vec![0u8; fs.stat(&ip).size];
            let n = fs.read_file(&ip, &mut buf, 0);
            fs.close(ip);
            std::io::stdout().write_all(&buf[..n])?;
            Ok(())
        }
        "put" => {
            let data = std::fs::read(path_arg(sub, "host"))?;
            let ctx = fs.begin_op();
            let ip = fs.create(&ctx, path, FileKind::File);
            if let Ok(ip) = &ip {
                // overwrite, not merge
                let mut guard = fs.inodes().lock(ip);
                fs.inodes().clear(&ctx, &mut guard);
            }
            fs.end_op(ctx);
            let ip = ip?;
            let n = fs.write_file(&ip, &data, 0);
            fs.close(ip);
            info!("put: {n} bytes to {path}");
            Ok(())
        }
        "mkdir" => {
            let ctx = fs.begin_op();
            let res = fs
                .create(&ctx, path, FileKind::Directory)
                .map(|ip| fs.inodes().put(&ctx, ip));
            fs.end_op(ctx);
            res
        }
        "rm" => {
            let ctx = fs.begin_op();
            let res = fs.unlink(&ctx, path);
            fs.end_op(ctx);
            res
        }
        "stat" => {
            let ctx = fs.begin_op();
            let ip = fs.open(&ctx, path);
            fs.end_op(ctx);
            let ip = ip?;
            let stat = fs.stat(&ip);
            fs.close(ip);
            println!(
                "inode {} kind {:?} nlink {} size {}",
                stat.inum, stat.kind, stat.nlink, stat.size
            );
            Ok(())
        }
        _ => unreachable!("clap accepted unknown command {name}"),
    }
}
