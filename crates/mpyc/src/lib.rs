//! mpyc - compile a Python subset to MicroPython `.mpy` files.
//!
//! Source text goes through the parser, the symbol-table builder and the
//! bytecode compiler, and the resulting code object tree is written in the
//! `.mpy` container format.
//!
//! # Example
//!
//! ```
//! use mpyc::{compile_to_mpy, read_mpy, CompilerConfig};
//!
//! let bytes = compile_to_mpy("x = 1\n", &CompilerConfig::default(), 32).unwrap();
//! assert_eq!(&bytes[..5], b"M\x05\x01\x1f\x20");
//!
//! let file = read_mpy(&bytes).unwrap();
//! assert_eq!(file.code.name, "<module>");
//! ```

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

pub use mpyc_bytecode as bytecode;
pub use mpyc_compiler as compiler;
pub use mpyc_container as container;
pub use mpyc_lexer as lexer;
pub use mpyc_parser as parser;

// Re-export commonly used types
pub use mpyc_bytecode::{disassemble, CodeObject, Constant, DecodeError};
pub use mpyc_compiler::{compile, CompilerConfig, CompilerError, SymbolTableError};
pub use mpyc_container::{read_mpy, ContainerError, ContainerOptions, FeatureFlags, MpyFile};
pub use mpyc_lexer::LexerError;
pub use mpyc_parser::{parse, Module, ParserError};

/// Error type for every stage of the pipeline.
#[derive(Error, Debug)]
pub enum Error {
    #[error("syntax error: {0}")]
    Parse(#[from] ParserError),

    #[error("compile error: {0}")]
    Compile(#[from] CompilerError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error("invalid bytecode: {0}")]
    Decode(#[from] DecodeError),

    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl Error {
    /// True when the input was an incompatible or corrupt `.mpy` image
    /// rather than a faulty source program.
    pub fn is_format_error(&self) -> bool {
        match self {
            Error::Container(ContainerError::Io(_)) => false,
            Error::Container(_) | Error::Decode(_) => true,
            Error::Parse(_) | Error::Compile(_) | Error::Io { .. } => false,
        }
    }

    fn io(path: &Path) -> impl FnOnce(std::io::Error) -> Error + '_ {
        move |source| Error::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Parse and compile `source` into its module code object.
pub fn compile_source(source: &str, config: &CompilerConfig) -> Result<CodeObject, Error> {
    let module = parse(source)?;
    Ok(compile(&module, config)?)
}

/// Compile `source` into a complete `.mpy` image.
pub fn compile_to_mpy(
    source: &str,
    config: &CompilerConfig,
    window_size: usize,
) -> Result<Vec<u8>, Error> {
    let code = compile_source(source, config)?;
    let options = ContainerOptions::for_compiler(config).with_window_size(window_size);
    Ok(mpyc_container::to_bytes(&code, &options)?)
}

/// Compile the source file at `input` and write the `.mpy` image to `output`.
///
/// The file name recorded in the code objects is `input` as given. The image
/// is written to a sibling file and renamed over `output` once complete, so
/// `output` is never left truncated.
pub fn compile_file(
    input: &Path,
    output: &Path,
    config: &CompilerConfig,
    window_size: usize,
) -> Result<CodeObject, Error> {
    let source = fs::read_to_string(input).map_err(Error::io(input))?;
    let config = CompilerConfig {
        filename: input.display().to_string(),
        ..config.clone()
    };
    let code = compile_source(&source, &config)?;
    let options = ContainerOptions::for_compiler(&config).with_window_size(window_size);

    let partial = partial_path(output);
    if let Err(e) = write_image(&partial, &code, &options) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    if let Err(source) = fs::rename(&partial, output) {
        let _ = fs::remove_file(&partial);
        return Err(Error::Io {
            path: output.to_path_buf(),
            source,
        });
    }
    info!(
        input = %input.display(),
        output = %output.display(),
        code_objects = code.count_code_objects(),
        "compiled"
    );
    Ok(code)
}

/// `prog.mpy` becomes `prog.mpy.partial` in the same directory.
fn partial_path(output: &Path) -> PathBuf {
    let mut name = output.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

fn write_image(path: &Path, code: &CodeObject, options: &ContainerOptions) -> Result<(), Error> {
    let mut writer = BufWriter::new(File::create(path).map_err(Error::io(path))?);
    mpyc_container::write_mpy(&mut writer, code, options).map_err(|e| match e {
        ContainerError::Io(source) => Error::Io {
            path: path.to_path_buf(),
            source,
        },
        other => Error::Container(other),
    })
}

/// Read and decode the `.mpy` file at `path`.
pub fn load_mpy(path: &Path) -> Result<MpyFile, Error> {
    let bytes = fs::read(path).map_err(Error::io(path))?;
    Ok(read_mpy(&bytes)?)
}

/// Decode a `.mpy` image and render a listing of every code object in it.
pub fn disassemble_mpy(bytes: &[u8]) -> Result<String, Error> {
    let file = read_mpy(bytes)?;
    Ok(disassemble(&file.code, file.options.cache_lookups())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_ok(source: &str) -> CodeObject {
        compile_source(source, &CompilerConfig::default())
            .unwrap_or_else(|e| panic!("compile failed for {:?}: {}", source, e))
    }

    fn round_trip(source: &str) {
        let config = CompilerConfig::default();
        let code = compile_ok(source);
        let bytes = compile_to_mpy(source, &config, 32).unwrap();
        let file = read_mpy(&bytes).unwrap();
        assert_eq!(file.code, code, "source: {}", source);
    }

    #[test]
    fn test_round_trips() {
        round_trip("x = 1\n");
        round_trip("def f(a, *b, c=1, **d):\n    return a + c\n");
        round_trip("class C(object):\n    def m(self):\n        return self.x\n");
        round_trip("try:\n    f()\nexcept E as e:\n    g(e)\nfinally:\n    h()\n");
        round_trip("from . import x\nimport os.path as p\n");
        round_trip("x = (1.5, 2j, b'\\x00', 'text', ..., 10 ** 100 if 0 else -1)\n");
    }

    #[test]
    fn test_error_categories() {
        let syntax = compile_source("def (:\n", &CompilerConfig::default()).unwrap_err();
        assert!(matches!(syntax, Error::Parse(_)));
        assert!(!syntax.is_format_error());

        let compile_err = compile_source("break\n", &CompilerConfig::default()).unwrap_err();
        assert!(matches!(compile_err, Error::Compile(CompilerError::Syntax { .. })));
        assert!(!compile_err.is_format_error());

        let format = disassemble_mpy(b"X\x05\x01\x1f\x20").unwrap_err();
        assert!(format.is_format_error());
    }

    #[test]
    fn test_disassemble_mpy_listing() {
        let bytes = compile_to_mpy("def f(x):\n    return x + 1\n", &CompilerConfig::default(), 32)
            .unwrap();
        let listing = disassemble_mpy(&bytes).unwrap();
        assert!(listing.contains("code <module>"));
        assert!(listing.contains("code f"));
        assert!(listing.contains("STORE_NAME f"));
        assert!(listing.contains("RETURN_VALUE"));
    }

    #[test]
    fn test_partial_path_is_a_sibling() {
        assert_eq!(
            partial_path(Path::new("out/prog.mpy")),
            PathBuf::from("out/prog.mpy.partial")
        );
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_mpy(Path::new("/nonexistent/input.mpy")).unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
        assert!(err.to_string().starts_with("/nonexistent/input.mpy"));
        assert!(!err.is_format_error());
    }
}
