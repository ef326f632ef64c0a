// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

use mvasm::obj::Hxo;
use mvasm::{asm, link};

#[derive(Debug, Parser)]
#[clap(max_term_width = 80, about = "the HSX assembler and linker")]
enum Mvasm {
    /// Assembles one MVASM source file into an HXO object.
    Asm {
        /// Source file.
        input: PathBuf,
        /// Output path; defaults to the input with an .hxo extension.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },

    /// Links HXO objects into a CRC-protected HXE v2 image and a .sym
    /// sidecar.
    Link {
        /// Object files, in link order.
        #[clap(required = true)]
        inputs: Vec<PathBuf>,
        /// Output image path.
        #[clap(short, long)]
        output: PathBuf,
        /// Symbol sidecar path; defaults to the output with a .sym
        /// extension.
        #[clap(long)]
        sym: Option<PathBuf>,
        /// Application name stamped into the header.
        #[clap(long, default_value = "app")]
        name: String,
        /// Entry symbol; overrides any .entry directive.
        #[clap(long)]
        entry: Option<String>,
        /// Set the allow-multiple-instances header flag.
        #[clap(long)]
        allow_multiple: bool,
    },

    /// Disassembles an HXE image's code segment.
    Dis {
        /// Image file.
        image: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Mvasm::parse() {
        Mvasm::Asm { input, output } => {
            let source = std::fs::read_to_string(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let file_name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let hxo = asm::assemble(&source, &file_name)?;
            let output =
                output.unwrap_or_else(|| input.with_extension("hxo"));
            std::fs::write(&output, hxo.to_json())
                .with_context(|| format!("writing {}", output.display()))?;
            tracing::info!(output = %output.display(), "assembled");
        }
        Mvasm::Link { inputs, output, sym, name, entry, allow_multiple } => {
            let mut objects = Vec::with_capacity(inputs.len());
            for path in &inputs {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                objects.push(
                    Hxo::from_json(&text)
                        .with_context(|| format!("parsing {}", path.display()))?,
                );
            }
            let options = link::LinkOptions {
                app_name: name,
                entry,
                allow_multiple_instances: allow_multiple,
                source_date_epoch: source_date_epoch(),
            };
            let (image, symfile) = link::link(&objects, &options)?;
            std::fs::write(&output, image.to_bytes())
                .with_context(|| format!("writing {}", output.display()))?;
            let sym_path = sym.unwrap_or_else(|| output.with_extension("sym"));
            std::fs::write(&sym_path, symfile.to_json())
                .with_context(|| format!("writing {}", sym_path.display()))?;
            tracing::info!(output = %output.display(), "linked");
        }
        Mvasm::Dis { image } => {
            let bytes = read_bytes(&image)?;
            let parsed = hsx_hxe::Image::parse(&bytes)?;
            print!("{}", mvasm::disassemble(&parsed));
        }
    }
    Ok(())
}

fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("reading {}", path.display()))
}

/// `SOURCE_DATE_EPOCH` per the reproducible-builds convention; zero when
/// unset or malformed.
fn source_date_epoch() -> u64 {
    std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
