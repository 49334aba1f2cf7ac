//! mpyc CLI - compile Python source to MicroPython `.mpy` files.
//!
//! Usage: `mpyc <INPUT> [-o OUTPUT] [--window-size N] [--cache-lookups] [--disassemble] [-v]`

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt};

use mpyc::container::DEFAULT_WINDOW_SIZE;
use mpyc::{CompilerConfig, Error};

#[derive(Parser, Debug)]
#[command(name = "mpyc", version)]
#[command(about = "Compile a Python subset to MicroPython .mpy files")]
struct Args {
    /// Source file (.py) to compile, or .mpy file to disassemble
    input: PathBuf,

    /// Output file; defaults to the input path with a .mpy extension
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Number of recent qstrs the container may refer back to
    #[arg(long, default_value_t = DEFAULT_WINDOW_SIZE)]
    window_size: usize,

    /// Emit cache bytes after name and attribute lookups
    #[arg(long)]
    cache_lookups: bool,

    /// Print a listing of the compiled or loaded code
    #[arg(long)]
    disassemble: bool,

    /// Log each compiled statement and container record
    #[arg(short, long)]
    verbose: bool,
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose);

    if let Err(e) = run(&args) {
        let kind = if e.is_format_error() {
            "invalid .mpy file"
        } else {
            "error"
        };
        eprintln!("{}: {}", kind, e);
        process::exit(1);
    }
}

/// Install the log subscriber. `RUST_LOG` overrides the default filter.
fn init_logging(verbose: bool) {
    let default = if verbose { "mpyc=debug" } else { "mpyc=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run(args: &Args) -> Result<(), Error> {
    if is_mpy(&args.input) {
        if !args.disassemble {
            return Err(usage_error(&args.input, "already compiled; pass --disassemble to list it"));
        }
        let bytes = fs::read(&args.input).map_err(|source| Error::Io {
            path: args.input.clone(),
            source,
        })?;
        print!("{}", mpyc::disassemble_mpy(&bytes)?);
        return Ok(());
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.with_extension("mpy"));
    if output == args.input {
        return Err(usage_error(&output, "output would overwrite the input"));
    }

    let config = CompilerConfig {
        cache_lookups: args.cache_lookups,
        ..Default::default()
    };
    debug!(input = %args.input.display(), output = %output.display(), "compiling");
    let code = mpyc::compile_file(&args.input, &output, &config, args.window_size)?;

    if args.disassemble {
        print!("{}", mpyc::disassemble(&code, args.cache_lookups)?);
    }
    Ok(())
}

fn is_mpy(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "mpy")
}

fn usage_error(path: &Path, message: &str) -> Error {
    Error::Io {
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, message.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_defaults() {
        let args = Args::try_parse_from(["mpyc", "prog.py"]).unwrap();
        assert_eq!(args.input, PathBuf::from("prog.py"));
        assert_eq!(args.output, None);
        assert_eq!(args.window_size, DEFAULT_WINDOW_SIZE);
        assert!(!args.cache_lookups);
        assert!(!args.disassemble);
    }

    #[test]
    fn test_parse_flags() {
        let args = Args::try_parse_from([
            "mpyc",
            "prog.py",
            "-o",
            "out.mpy",
            "--window-size",
            "8",
            "--cache-lookups",
            "--disassemble",
            "-v",
        ])
        .unwrap();
        assert_eq!(args.output, Some(PathBuf::from("out.mpy")));
        assert_eq!(args.window_size, 8);
        assert!(args.cache_lookups && args.disassemble && args.verbose);
    }

    #[test]
    fn test_mpy_input_requires_disassemble() {
        let args = Args::try_parse_from(["mpyc", "prog.mpy"]).unwrap();
        let err = run(&args).unwrap_err();
        assert!(err.to_string().contains("--disassemble"));
    }

    #[test]
    fn test_compile_then_disassemble() {
        let dir = std::env::temp_dir().join(format!("mpyc-cli-{}", process::id()));
        fs::create_dir_all(&dir).unwrap();
        let input = dir.join("prog.py");
        fs::write(&input, "x = 1\n").unwrap();

        let args = Args::try_parse_from(["mpyc", input.to_str().unwrap()]).unwrap();
        run(&args).unwrap();
        let output = dir.join("prog.mpy");
        assert!(output.exists());

        let args =
            Args::try_parse_from(["mpyc", output.to_str().unwrap(), "--disassemble"]).unwrap();
        run(&args).unwrap();
        fs::remove_dir_all(&dir).unwrap();
    }
}
