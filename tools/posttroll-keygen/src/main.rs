// SPDX-License-Identifier: GPL-3.0-or-later

//! Create a public/secret key pair for the posttroll secure backend.

use clap::Parser;
use posttroll::net::keys::generate_key_files;
use std::path::PathBuf;
use std::process::ExitCode;

/// Create a public/secret key pair for the secure backend.
///
/// This will create two files (in the current directory if not otherwise
/// specified) with the suffixes '.key' and '.key_secret'. The name of the
/// files will be the one provided.
#[derive(Parser, Debug)]
#[command(name = "posttroll-generate-keys", version)]
struct Args {
    /// Name of the key files.
    name: String,

    /// Directory to place the keys in.
    #[arg(short, long, default_value = ".")]
    directory: PathBuf,
}

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match generate_key_files(&args.directory, &args.name) {
        Ok((public_path, secret_path)) => {
            println!("wrote {}", public_path.display());
            println!("wrote {}", secret_path.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("could not generate keys: {e}");
            ExitCode::from(2)
        }
    }
}
