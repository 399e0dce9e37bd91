//! Build script rendering the `respmux(1)` manual page from the clap
//! definition in `src/cli.rs`.

use std::{env, fs, path::PathBuf};

use clap::CommandFactory;
use clap_mangen::Man;

#[path = "src/cli.rs"]
mod cli;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=src/cli.rs");
    println!("cargo:rerun-if-env-changed=RESPMUX_MAN_DIR");

    let out_dir = env::var_os("RESPMUX_MAN_DIR")
        .map_or_else(|| PathBuf::from("target/generated-man"), PathBuf::from);
    fs::create_dir_all(&out_dir)?;

    let cmd = cli::Cli::command();
    let page = format!("{}.1", cmd.get_name());
    let man = Man::new(cmd)
        .section("1")
        .manual("respmux manual")
        .source(format!("respmux {}", env!("CARGO_PKG_VERSION")));
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    fs::write(out_dir.join(page), buf)?;

    Ok(())
}
