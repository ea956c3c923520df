/*!
Resolves and prints the `SMKM_STORE_MGR` offsets of a kernel image on disk.

```text
cargo run --example resolve -- ntoskrnl.exe --symbols ntoskrnl.map -vv
```
*/

use clap::{command, Arg, ArgAction};
use log::info;
use simplelog::{ColorChoice, Config, LevelFilter, TermLogger, TerminalMode};

use memflow_smkm::*;

fn parse_hex(s: &str) -> std::result::Result<u64, String> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let matches = command!()
        .arg(
            Arg::new("image")
                .help("PE image, e.g. ntoskrnl.exe")
                .required(true),
        )
        .arg(
            Arg::new("symbols")
                .long("symbols")
                .short('s')
                .help("symbol map with `<address> [type] <name>` lines, defaults to the exports"),
        )
        .arg(
            Arg::new("sentinel")
                .long("sentinel")
                .help("hex base value injected before emulation")
                .value_parser(parse_hex),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .action(ArgAction::Count)
                .help("increase log verbosity"),
        )
        .get_matches();

    let level = match matches.get_count("verbose") {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    TermLogger::init(level, Config::default(), TerminalMode::Stderr, ColorChoice::Auto)?;

    let path = matches
        .get_one::<String>("image")
        .ok_or("missing image argument")?;
    let buf = std::fs::read(path)?;

    let image = KernelImage::from_pe(&buf)?;

    let symbols = match matches.get_one::<String>("symbols") {
        Some(map) => SymbolTable::parse_map(&std::fs::read_to_string(map)?)?,
        None => SymbolTable::from_pe_exports(&buf)?,
    };

    info!("{} symbols", symbols.len());

    let mut config = ResolverConfig::default();
    if let Some(sentinel) = matches.get_one::<u64>("sentinel") {
        config.sentinel = *sentinel;
    }

    let resolver = OffsetResolver::new(&image, &symbols).with_config(config);
    let offsets = SmkmStoreMgr::dump(&resolver)?;

    println!("sSmKm       {:#x}", offsets.sm_km);
    println!("sGlobalTree {:#x}", offsets.global_tree);

    Ok(())
}
