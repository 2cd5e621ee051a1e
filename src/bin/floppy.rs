/// Interactive console for CP/M-family floppy images

use std::path::PathBuf;
use std::process::ExitCode;

use floppyfs::{image, CpmFs, FileAttr, Filesystem, Variant};
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Context, Editor, Helper};

/// Command completer for the REPL
struct CommandCompleter {
    commands: Vec<&'static str>,
}

impl CommandCompleter {
    fn new() -> Self {
        Self {
            commands: vec![
                "cat", "create", "dir", "entries", "exit", "help", "info", "ls", "quit", "rm",
                "save", "stat", "truncate", "write",
            ],
        }
    }
}

impl Completer for CommandCompleter {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        // Only complete the first word (command name)
        let line_to_cursor = &line[..pos];
        if line_to_cursor.contains(' ') {
            return Ok((pos, vec![]));
        }

        let prefix = line_to_cursor.to_lowercase();
        let matches: Vec<Pair> = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(&prefix))
            .map(|cmd| Pair {
                display: cmd.to_string(),
                replacement: cmd.to_string(),
            })
            .collect();

        Ok((0, matches))
    }
}

impl Hinter for CommandCompleter {
    type Hint = String;
}

impl Highlighter for CommandCompleter {}
impl Validator for CommandCompleter {}
impl Helper for CommandCompleter {}

fn version() {
    println!("floppyfs version {}", env!("CARGO_PKG_VERSION"));
}

fn help(progname: &str) {
    version();
    println!("Usage: {} [options] --file=<disk-image>", progname);
    println!("    --file=<disk-image>    The path to the disk image to load");
    println!("    --filesystem=<fs>      The filesystem type, cpm or hc (default: hc)");
    println!();
}

fn print_help() {
    println!("Commands:");
    println!("  dir | ls              List files");
    println!("  cat <name>            Print a file's contents");
    println!("  stat <name>           Show a file's attributes");
    println!("  create <name>         Create an empty file");
    println!("  write <name> <text>   Write text at the start of a file");
    println!("  truncate <name> <n>   Resize a file to n bytes");
    println!("  rm <name>             Delete a file");
    println!("  entries               Dump the raw directory entries");
    println!("  info                  Show image and filesystem statistics");
    println!("  save                  Flush changes back to the image file");
    println!("  help                  Show this help");
    println!("  quit | exit           Save and leave");
}

/// Normalize a console filename into the flat path space
fn file_path(name: &str) -> String {
    if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{}", name)
    }
}

fn print_attr(name: &str, attr: &FileAttr) {
    println!(
        "{:>10}  mode {:o}  blocks {:>4}  {}",
        attr.size, attr.mode, attr.blocks, name
    );
}

fn list_files(fs: &CpmFs) {
    let mut count = 0usize;
    let mut total = 0u64;

    let result = fs.readdir("/", &mut |name, attr| {
        print_attr(name, attr);
        count += 1;
        total += attr.size;
        false
    });

    match result {
        Ok(()) => println!("{} file(s), {} bytes", count, total),
        Err(e) => println!("Error: {}", e),
    }
}

fn print_entries(fs: &CpmFs) {
    for (i, entry) in fs.entries().iter().enumerate() {
        if entry.free() {
            continue;
        }

        print!("entry {:>3}: \"{}\"", i, entry.name());

        if entry.read_only() {
            print!(" (read-only)");
        }
        if entry.hidden() {
            print!(" (hidden)");
        }
        if entry.ex_lo() != 0 || entry.ex_hi() != 0 {
            print!(" (extent {}/{})", entry.ex_lo(), entry.ex_hi());
        }
        println!();

        println!("\trecord count: {}", entry.record_count());

        print!("\tallocation units:");
        for unit in entry.allocation_units() {
            print!(" {:04x}", unit);
        }
        println!();
    }
}

fn print_info(fs: &CpmFs) {
    let props = fs.disk().properties();

    println!(
        "geometry: {} tracks, {} heads, {} sectors of {} bytes ({} KiB)",
        props.tracks(),
        props.heads(),
        props.sectors(),
        props.sector_size(),
        props.size() / 1024
    );
    println!("filesystem: {}", fs.variant());
    println!("modified: {}", fs.disk().modified());

    match fs.statfs("/") {
        Ok(stats) => {
            println!(
                "blocks: {} total, {} free ({} bytes each)",
                stats.blocks, stats.blocks_free, stats.block_size
            );
            println!(
                "directory: {} slots, {} free",
                stats.files, stats.files_free
            );
        }
        Err(e) => println!("Error: {}", e),
    }
}

fn cat(fs: &CpmFs, path: &str) {
    let size = match fs.getattr(path) {
        Ok(attr) => attr.size as usize,
        Err(e) => {
            println!("Error: {}", e);
            return;
        }
    };

    let mut buf = vec![0u8; size];
    match fs.read(path, &mut buf, 0) {
        Ok(n) => {
            buf.truncate(n);
            println!("{}", String::from_utf8_lossy(&buf));
        }
        Err(e) => println!("Error: {}", e),
    }
}

fn write_text(fs: &mut CpmFs, path: &str, text: &str) {
    if fs.open(path).is_err() {
        if let Err(e) = fs.create(path) {
            println!("Error: {}", e);
            return;
        }
    }

    match fs.write(path, text.as_bytes(), 0) {
        Ok(n) => println!("{} bytes written", n),
        Err(e) => println!("Error: {}", e),
    }
}

struct Options {
    file: Option<String>,
    filesystem: String,
    help: bool,
    version: bool,
}

fn parse_args(args: &[String]) -> Options {
    let mut options = Options {
        file: None,
        filesystem: "hc".to_string(),
        help: false,
        version: false,
    };

    for arg in args {
        if let Some(path) = arg.strip_prefix("--file=") {
            options.file = Some(path.to_string());
        } else if let Some(fs) = arg.strip_prefix("--filesystem=") {
            options.filesystem = fs.to_string();
        } else if arg == "-h" || arg == "--help" {
            options.help = true;
        } else if arg == "-V" || arg == "--version" {
            options.version = true;
        } else if options.file.is_none() && !arg.starts_with('-') {
            options.file = Some(arg.to_string());
        }
    }

    options
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .without_time()
        .init();

    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args[1..]);

    if options.help {
        help(&args[0]);
        return ExitCode::SUCCESS;
    }

    if options.version {
        version();
        return ExitCode::SUCCESS;
    }

    let Some(file) = options.file else {
        eprintln!("Error: please use `--file' to indicate a disk image to load");
        return ExitCode::FAILURE;
    };

    let Some(variant) = Variant::from_name(&options.filesystem) else {
        eprintln!("Error: unsupported filesystem \"{}\"", options.filesystem);
        return ExitCode::FAILURE;
    };

    let disk = match image::open(&file) {
        Ok(disk) => disk,
        Err(e) => {
            eprintln!("Error: failed to load the disk image \"{}\": {}", file, e);
            return ExitCode::FAILURE;
        }
    };

    let mut fs = match CpmFs::new(disk, variant) {
        Ok(fs) => fs,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let image_path = PathBuf::from(&file);

    println!("=== floppyfs ===");
    println!("Mounted {} as {}.", file, variant);
    println!("Type 'help' for available commands\n");

    let mut rl: Editor<CommandCompleter, DefaultHistory> = match Editor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Error: failed to create editor: {}", e);
            return ExitCode::FAILURE;
        }
    };
    rl.set_helper(Some(CommandCompleter::new()));

    loop {
        let input = match rl.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("^C");
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        };

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        let _ = rl.add_history_entry(input);

        let parts: Vec<&str> = input.split_whitespace().collect();
        let command = parts[0].to_lowercase();

        match command.as_str() {
            "help" => print_help(),
            "quit" | "exit" => break,
            "dir" | "ls" => list_files(&fs),
            "entries" => print_entries(&fs),
            "info" => print_info(&fs),
            "cat" => {
                if parts.len() < 2 {
                    println!("Usage: cat <name>");
                    continue;
                }
                cat(&fs, &file_path(parts[1]));
            }
            "stat" => {
                if parts.len() < 2 {
                    println!("Usage: stat <name>");
                    continue;
                }
                match fs.getattr(&file_path(parts[1])) {
                    Ok(attr) => print_attr(parts[1], &attr),
                    Err(e) => println!("Error: {}", e),
                }
            }
            "create" => {
                if parts.len() < 2 {
                    println!("Usage: create <name>");
                    continue;
                }
                match fs.create(&file_path(parts[1])) {
                    Ok(()) => println!("Created {}", parts[1]),
                    Err(e) => println!("Error: {}", e),
                }
            }
            "write" => {
                if parts.len() < 3 {
                    println!("Usage: write <name> <text>");
                    continue;
                }
                write_text(&mut fs, &file_path(parts[1]), &parts[2..].join(" "));
            }
            "truncate" => {
                let length = parts.get(2).and_then(|n| n.parse::<u64>().ok());
                let (Some(name), Some(length)) = (parts.get(1), length) else {
                    println!("Usage: truncate <name> <length>");
                    continue;
                };
                match fs.truncate(&file_path(name), length) {
                    Ok(()) => println!("Truncated {} to {} bytes", name, length),
                    Err(e) => println!("Error: {}", e),
                }
            }
            "rm" => {
                if parts.len() < 2 {
                    println!("Usage: rm <name>");
                    continue;
                }
                match fs.unlink(&file_path(parts[1])) {
                    Ok(()) => println!("Deleted {}", parts[1]),
                    Err(e) => println!("Error: {}", e),
                }
            }
            "save" => match fs.save(&image_path) {
                Ok(()) => println!("Saved {}", image_path.display()),
                Err(e) => println!("Error: {}", e),
            },
            _ => println!("Unknown command '{}'. Type 'help' for a list.", command),
        }
    }

    // the image is only rewritten if something changed
    if let Err(e) = fs.save(&image_path) {
        eprintln!("Error: failed to save \"{}\": {}", image_path.display(), e);
        return ExitCode::FAILURE;
    }

    println!("Goodbye!");
    ExitCode::SUCCESS
}
