//! KC emulator CLI - Run Z1013, Z9001/KC87 and Huebler systems in a terminal.
//!
//! Usage:
//!   kcemu run [options]
//!   kcemu disk info <image>
//!   kcemu disk export <image> <output>
//!   kcemu disk catalog
//!
//! Examples:
//!   kcemu run --roms roms.zip                         # Z1013.64 with monitor 2.02
//!   kcemu run --roms roms.zip --system KC87           # KC87 with BASIC
//!   kcemu run --roms roms.zip --system KC87 \
//!       --set jkcemu.z9001.floppydisk.enabled=true --disk 0=cpm.dump
//!   kcemu run --roms roms.zip --headless --seconds 3 --paste prog.txt
//!   kcemu disk export disk.img disk.dsk               # plain image to CPCEMU

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use clap::{Parser, Subcommand};
use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    queue,
    style::Print,
    terminal::{self, disable_raw_mode, enable_raw_mode, ClearType},
};
use log::{LevelFilter, Log, Metadata, Record};
use tokio::sync::mpsc as tokio_mpsc;

use kcemu_core::devices::SpecialKey;
use kcemu_core::disk::{anadisk, cpc, DiskStation};
use kcemu_core::system::{z1013, z9001, HueblerMc, Z1013, Z9001};
use kcemu_core::{
    AnySystem, Emulator, KcError, KcResult, KcSystem, PrintSink, Properties, RomResources,
};

/// Emulated time per run slice.
const SLICE_MS: u32 = 20;

/// Slices a typed key stays pressed.
const KEY_HOLD_SLICES: u32 = 4;

/// Slices between two screen refreshes.
const REDRAW_SLICES: u32 = 5;

/// KC Emulator CLI
#[derive(Parser, Debug)]
#[command(name = "kcemu")]
#[command(about = "Emulate East German 8-bit home computers")]
struct Args {
    /// Increase log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run an emulated system
    Run(RunArgs),

    /// Floppy disk image tools
    #[command(subcommand)]
    Disk(DiskCommand),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// System name, e.g. z1013, Z1013.01, KC87, KC85/1, z9001, huebler
    #[arg(short, long)]
    system: Option<String>,

    /// ROM resource package (ZIP)
    #[arg(short, long, alias = "rom-pack")]
    roms: Option<PathBuf>,

    /// Property file (JSON object of settings)
    #[arg(short, long)]
    props: Option<PathBuf>,

    /// Single setting, KEY=VALUE
    #[arg(long = "set", value_name = "KEY=VALUE")]
    settings: Vec<String>,

    /// Mount a disk image, DRIVE=PATH (read-only unless --writable)
    #[arg(long = "disk", value_name = "DRIVE=PATH")]
    disks: Vec<String>,

    /// Mount disk images writable
    #[arg(long)]
    writable: bool,

    /// Step twice per cylinder for the --disk images (SD disk in a DD
    /// drive); default: on for images with fewer than 50 cylinders
    #[arg(long, value_name = "BOOL")]
    skip_odd_cylinders: Option<bool>,

    /// Text file pasted into the system after start
    #[arg(long)]
    paste: Option<PathBuf>,

    /// Printer output file (default: stderr)
    #[arg(long)]
    printer: Option<PathBuf>,

    /// Run without real-time throttling
    #[arg(long)]
    max_speed: bool,

    /// No terminal UI: run for --seconds and print the screen
    #[arg(long)]
    headless: bool,

    /// Emulated seconds to run in headless mode
    #[arg(long, default_value_t = 5)]
    seconds: u32,

    /// Trace every log message
    #[arg(short, long)]
    trace: bool,
}

#[derive(Subcommand, Debug)]
enum DiskCommand {
    /// Show format and geometry of an image
    Info { image: PathBuf },

    /// Convert an image; the output extension selects CPCEMU (.dsk) or AnaDisk (.dump)
    Export { image: PathBuf, output: PathBuf },

    /// List the bundled system disks
    Catalog {
        /// Extract entry NUM of the catalog from the ROM package to --output
        #[arg(long, requires_all = ["roms", "output"])]
        extract: Option<usize>,

        #[arg(short, long)]
        roms: Option<PathBuf>,

        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Log sink writing to stderr.
struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            // raw mode needs the explicit carriage return
            eprint!("[{}] {}\r\n", record.level(), record.args());
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn init_logger(verbose: u8, trace: bool) {
    let level = match (trace, verbose) {
        (true, _) => LevelFilter::Trace,
        (false, 0) => LevelFilter::Warn,
        (false, 1) => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Printer output to stderr or a file.
enum CliPrinter {
    Stderr,
    File(File),
}

impl PrintSink for CliPrinter {
    fn print(&mut self, byte: u8) {
        let result = match self {
            CliPrinter::Stderr => std::io::stderr().write_all(&[byte]),
            CliPrinter::File(f) => f.write_all(&[byte]),
        };
        if let Err(e) = result {
            log::warn!("printer: {}", e);
        }
    }
}

/// Terminal input forwarded to the emulation thread.
#[derive(Debug, Clone, Copy)]
enum Input {
    Char(char),
    Special(SpecialKey, bool),
    Quit,
}

/// Translate crossterm key events to system keys.
fn translate_key(code: KeyCode, modifiers: KeyModifiers) -> Option<Input> {
    let shift = modifiers.contains(KeyModifiers::SHIFT);
    if modifiers.contains(KeyModifiers::CONTROL) {
        if let KeyCode::Char(c) = code {
            let upper = c.to_ascii_uppercase();
            if upper == 'Q' {
                return Some(Input::Quit);
            }
            if upper.is_ascii_uppercase() {
                return Some(Input::Char((upper as u8 - 64) as char));
            }
        }
        return None;
    }
    let special = match code {
        KeyCode::Char(' ') => SpecialKey::Space,
        KeyCode::Char(c) => return Some(Input::Char(c)),
        KeyCode::Enter => SpecialKey::Enter,
        KeyCode::Backspace => SpecialKey::Backspace,
        KeyCode::Esc => SpecialKey::Escape,
        KeyCode::Up => SpecialKey::Up,
        KeyCode::Down => SpecialKey::Down,
        KeyCode::Left => SpecialKey::Left,
        KeyCode::Right => SpecialKey::Right,
        KeyCode::Insert => SpecialKey::Insert,
        KeyCode::Delete => SpecialKey::Delete,
        KeyCode::F(n @ 1..=8) => SpecialKey::Function(n),
        _ => return None,
    };
    Some(Input::Special(special, shift))
}

fn parse_setting(text: &str) -> Result<(String, String), String> {
    text.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got {}", text))
}

/// Settings from the property file, the system name, --set and --disk.
fn build_properties(args: &RunArgs) -> Result<Properties, Box<dyn std::error::Error>> {
    let mut props = match &args.props {
        Some(path) => Properties::load(path)?,
        None => Properties::new(),
    };
    if let Some(name) = &args.system {
        props.set(kcemu_core::system::PROP_SYSNAME, name.as_str());
    }
    for setting in &args.settings {
        let (key, value) = parse_setting(setting)?;
        props.set(key, value);
    }
    for disk in &args.disks {
        let (drive, path) = parse_setting(disk)?;
        let drive: usize = drive.parse().map_err(|_| format!("invalid drive number {}", drive))?;
        props.set(format!("jkcemu.floppydisk.{}.file", drive), path);
        props.set_bool(format!("jkcemu.floppydisk.{}.readonly", drive), !args.writable);
        if let Some(skip) = args.skip_odd_cylinders {
            props.set_bool(format!("jkcemu.floppydisk.{}.skip_odd_cylinders", drive), skip);
        }
    }
    Ok(props)
}

struct RunOptions {
    headless: bool,
    max_speed: bool,
    seconds: u32,
    paste: Option<String>,
}

/// Draw the text screen; rows are only rewritten when they changed.
fn draw_screen(text: &str, last: &mut Vec<String>) -> std::io::Result<()> {
    let mut out = std::io::stdout().lock();
    for (row, line) in text.lines().enumerate() {
        if last.get(row).map(String::as_str) == Some(line) {
            continue;
        }
        queue!(
            out,
            MoveTo(0, row as u16),
            Print(line),
            terminal::Clear(ClearType::UntilNewLine)
        )?;
    }
    out.flush()?;
    *last = text.lines().map(str::to_string).collect();
    Ok(())
}

/// Emulation thread: runs slices of [`SLICE_MS`] emulated milliseconds,
/// feeds keys and refreshes the screen.
fn run_system<S: KcSystem + Send + 'static>(
    mut sys: S,
    printer: CliPrinter,
    opts: RunOptions,
    key_rx: mpsc::Receiver<Input>,
) -> String {
    sys.set_printer(Box::new(printer));
    if let Some(station) = sys.disk_station() {
        if let Ok(mut station) = station.lock() {
            station.set_error_listener(Some(Arc::new(|msg: &str| log::error!("disk: {}", msg))));
        }
    }
    let mut emu = Emulator::new(sys);
    emu.max_speed = opts.max_speed || opts.headless;
    log::info!("{} running at {} kHz", emu.machine().title(), emu.speed_khz());

    let mut pending_paste = opts.paste;
    let mut key_hold = 0u32;
    let mut slices = 0u32;
    let mut last_screen = Vec::new();
    let total_slices = opts.seconds * 1000 / SLICE_MS;
    let stop = emu.stop_handle();

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        // the OS must be up before it reads pasted text
        if slices == 50 {
            if let Some(text) = pending_paste.take() {
                if !emu.machine_mut().paste(&text) {
                    log::warn!("{} cannot paste with the current settings", emu.machine().title());
                }
            }
        }
        while let Ok(input) = key_rx.try_recv() {
            let taken = match input {
                Input::Char(ch) => emu.machine_mut().key_typed(ch),
                Input::Special(key, shift) => emu.machine_mut().key_pressed(key, shift),
                Input::Quit => {
                    emu.die();
                    break;
                }
            };
            if taken {
                key_hold = KEY_HOLD_SLICES;
            }
        }
        emu.run_for(emu.speed_khz() as u64 * SLICE_MS as u64);
        if key_hold > 0 {
            key_hold -= 1;
            if key_hold == 0 {
                emu.machine_mut().key_released();
            }
        }

        slices += 1;
        if opts.headless {
            if slices >= total_slices {
                break;
            }
        } else if slices % REDRAW_SLICES == 0 {
            let text = emu.machine().screen_text();
            if let Err(e) = draw_screen(&text, &mut last_screen) {
                log::warn!("screen: {}", e);
            }
        }
    }
    emu.die();
    emu.machine().screen_text()
}

async fn run_command(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let props = build_properties(&args)?;
    let resources = match &args.roms {
        Some(path) => RomResources::load_from_path(path)?,
        None => {
            log::warn!("no ROM package given, ROM areas read as 0xFF");
            RomResources::new()
        }
    };
    let printer = match &args.printer {
        Some(path) => CliPrinter::File(File::create(path)?),
        None => CliPrinter::Stderr,
    };
    let paste = match &args.paste {
        Some(path) => Some(std::fs::read_to_string(path)?),
        None => None,
    };
    let opts = RunOptions {
        headless: args.headless,
        max_speed: args.max_speed,
        seconds: args.seconds.max(1),
        paste,
    };
    let system = AnySystem::create(&props, Arc::new(resources));

    let (key_tx, key_rx) = mpsc::channel::<Input>();
    let (shutdown_tx, mut shutdown_rx) = tokio_mpsc::channel::<()>(1);

    let raw_mode_enabled = !opts.headless && enable_raw_mode().is_ok();
    if raw_mode_enabled {
        let mut out = std::io::stdout();
        let _ = crossterm::execute!(out, terminal::Clear(ClearType::All), Hide);
    }

    let emu_handle = tokio::task::spawn_blocking(move || match system {
        AnySystem::Z1013(sys) => run_system::<Z1013>(sys, printer, opts, key_rx),
        AnySystem::Z9001(sys) => run_system::<Z9001>(sys, printer, opts, key_rx),
        AnySystem::Huebler(sys) => run_system::<HueblerMc>(sys, printer, opts, key_rx),
    });

    let input_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    break;
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    if !raw_mode_enabled {
                        continue;
                    }
                    if event::poll(Duration::from_millis(0)).unwrap_or(false) {
                        if let Ok(Event::Key(key_event)) = event::read() {
                            if key_event.kind == KeyEventKind::Release {
                                continue;
                            }
                            if let Some(input) = translate_key(key_event.code, key_event.modifiers) {
                                if key_tx.send(input).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
    });

    let screen = emu_handle.await?;

    let _ = shutdown_tx.send(()).await;
    let _ = input_handle.await;

    if raw_mode_enabled {
        let _ = crossterm::execute!(std::io::stdout(), Show);
        let _ = disable_raw_mode();
        println!();
    } else {
        print!("{}", screen);
    }
    Ok(())
}

fn open_image(path: &Path) -> KcResult<DiskStation> {
    let mut station = DiskStation::new(1, None);
    station.open_path(0, path, true, None, Some(false))?;
    Ok(station)
}

fn disk_command(cmd: DiskCommand) -> Result<(), Box<dyn std::error::Error>> {
    match cmd {
        DiskCommand::Info { image } => {
            let station = open_image(&image)?;
            if let Some(text) = station.disk_info_text(0) {
                println!("{}", text);
            }
        }
        DiskCommand::Export { image, output } => {
            let station = open_image(&image)?;
            let disk = station
                .drive(0)
                .and_then(|d| d.disk())
                .ok_or(KcError::InvalidDrive(0))?;
            let ext = output
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            match ext.as_str() {
                "dsk" => cpc::export(disk, &output)?,
                "dump" | "dmp" => std::fs::write(&output, anadisk::export_bytes(disk)?)?,
                _ => return Err(KcError::UnsupportedFile(output.display().to_string()).into()),
            }
            eprintln!("Exported {} to {}", image.display(), output.display());
        }
        DiskCommand::Catalog { extract, roms, output } => {
            let catalog: Vec<_> = z1013::AVAILABLE_DISKS
                .iter()
                .chain(z9001::AVAILABLE_DISKS.iter())
                .collect();
            match (extract, roms, output) {
                (Some(num), Some(roms), Some(output)) => {
                    let info = catalog
                        .get(num)
                        .ok_or_else(|| format!("no catalog entry {}", num))?;
                    let resources = RomResources::load_from_path(&roms)?;
                    let station = DiskStation::new(1, Some(Arc::new(resources)));
                    station.export_resource(info, &output)?;
                    eprintln!("Extracted {} to {}", info.text, output.display());
                }
                _ => {
                    for (num, info) in catalog.iter().enumerate() {
                        println!("{:2}  {:<40} {}", num, info.text, info.resource);
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let trace = matches!(&args.command, Command::Run(run) if run.trace);
    init_logger(args.verbose, trace);

    let result = match args.command {
        Command::Run(run) => run_command(run).await,
        Command::Disk(cmd) => disk_command(cmd),
    };
    if let Err(e) = &result {
        eprintln!("\nError: {}", e);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_translate_key() {
        assert!(matches!(
            translate_key(KeyCode::Char('a'), KeyModifiers::NONE),
            Some(Input::Char('a'))
        ));
        assert!(matches!(
            translate_key(KeyCode::Char('c'), KeyModifiers::CONTROL),
            Some(Input::Char('\u{3}'))
        ));
        assert!(matches!(
            translate_key(KeyCode::Char('q'), KeyModifiers::CONTROL),
            Some(Input::Quit)
        ));
        assert!(matches!(
            translate_key(KeyCode::Enter, KeyModifiers::SHIFT),
            Some(Input::Special(SpecialKey::Enter, true))
        ));
        assert!(translate_key(KeyCode::F(12), KeyModifiers::NONE).is_none());
    }

    #[test]
    fn test_build_properties() {
        let args = RunArgs::parse_from_args(&[
            "--system",
            "KC87",
            "--set",
            "jkcemu.z9001.floppydisk.enabled = true",
            "--disk",
            "1=/tmp/cpm.dump",
            "--skip-odd-cylinders",
            "false",
        ]);
        let props = build_properties(&args).unwrap();
        assert_eq!(props.get_str("jkcemu.system"), Some("KC87"));
        assert!(props.get_bool("jkcemu.z9001.floppydisk.enabled", false));
        assert_eq!(props.get_str("jkcemu.floppydisk.1.file"), Some("/tmp/cpm.dump"));
        assert!(props.get_bool("jkcemu.floppydisk.1.readonly", false));
        assert_eq!(props.get_str("jkcemu.floppydisk.1.skip_odd_cylinders"), Some("false"));

        assert!(parse_setting("novalue").is_err());
        assert!(parse_setting("=x").is_err());
    }

    impl RunArgs {
        fn parse_from_args(list: &[&str]) -> Self {
            let mut argv = vec!["kcemu", "run"];
            argv.extend_from_slice(list);
            match Args::parse_from(argv).command {
                Command::Run(run) => run,
                Command::Disk(_) => unreachable!(),
            }
        }
    }
}
