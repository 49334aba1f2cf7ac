//! mpyc container - the `.mpy` file format.
//!
//! A file is a fixed header followed by one code record per code object,
//! nested depth-first. Strings inside records go through a shared
//! most-recently-used window so repeated identifiers cost a single byte.

pub mod error;
pub mod header;
pub mod reader;
pub mod window;
pub mod writer;

pub use error::ContainerError;
pub use header::{
    ContainerOptions, DEFAULT_SMALL_INT_BITS, DEFAULT_WINDOW_SIZE, FeatureFlags, MAGIC, VERSION,
};
pub use reader::{MpyFile, MpyReader, load_mpy, read_mpy};
pub use window::QstrWindow;
pub use writer::{MpyWriter, to_bytes, write_mpy};

/// Low two bits of a record's length field for bytecode records.
pub(crate) const CODE_KIND_BYTECODE: u8 = 0;

/// Static qstr number of the empty string.
pub(crate) const STATIC_QSTR_EMPTY: u8 = 1;

#[cfg(test)]
mod tests {
    use super::*;
    use mpyc_bytecode::{CodeBuilder, CodeObject, Constant, Op, ScopeFlags, ScopeInfo};

    fn function(name: &str, build: impl FnOnce(&mut CodeBuilder)) -> CodeObject {
        let mut b = CodeBuilder::new(false);
        b.set_line(2);
        build(&mut b);
        b.finish(ScopeInfo {
            name: name.into(),
            filename: "t.py".into(),
            flags: ScopeFlags::VARARGS,
            n_locals: 2,
            n_pos_args: 1,
            argnames: vec!["a".into()],
            ..Default::default()
        })
        .unwrap()
    }

    fn module() -> CodeObject {
        let child = function("f", |b| {
            b.emit_load_fast(0);
            b.emit_qstr(Op::LoadAttr, "x");
            b.emit(Op::ReturnValue);
        });
        let mut b = CodeBuilder::new(false);
        b.set_line(1);
        b.emit_const(Constant::Str("text".into()));
        b.emit_qstr(Op::StoreName, "x");
        b.emit_const(Constant::Int(1 << 40));
        b.emit_const(Constant::Bytes(vec![0, 0xff]));
        b.emit_const(Constant::Float(-0.5));
        b.emit_const(Constant::Complex { real: 1.0, imag: -2.0 });
        b.emit_const(Constant::Ellipsis);
        b.emit_arg(Op::BuildTuple, 5);
        b.emit_qstr(Op::StoreName, "x");
        b.emit_make_function(child, 0, false);
        b.emit_qstr(Op::StoreName, "f");
        b.emit(Op::LoadConstNone);
        b.emit(Op::ReturnValue);
        b.finish(ScopeInfo {
            name: "<module>".into(),
            filename: "t.py".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_round_trip_preserves_tree() {
        let code = module();
        let bytes = to_bytes(&code, &ContainerOptions::default()).unwrap();
        let file = read_mpy(&bytes).unwrap();
        assert_eq!(file.options, ContainerOptions::default());
        assert_eq!(file.code, code);
    }

    #[test]
    fn test_repeated_qstr_uses_window() {
        let code = module();
        let bytes = to_bytes(&code, &ContainerOptions::default()).unwrap();
        let literal = [0x02, b'x'];
        let first = bytes
            .windows(2)
            .position(|w| w == literal)
            .expect("no literal qstr");
        // STORE_NAME x again: back-reference to window slot 0.
        assert!(bytes[first + 2..].windows(2).all(|w| w != literal));
        assert!(bytes[first + 2..].windows(2).any(|w| w == [Op::StoreName as u8, 0x01]));

        let unwindowed = ContainerOptions::default().with_window_size(0);
        let longer = to_bytes(&code, &unwindowed).unwrap();
        assert!(longer.len() > bytes.len());
        assert_eq!(read_mpy(&longer).unwrap().code, code);
    }

    #[test]
    fn test_empty_qstr_is_static() {
        let mut b = CodeBuilder::new(false);
        b.emit_small_int(1);
        b.emit_qstr(Op::LoadConstString, "*");
        b.emit_arg(Op::BuildTuple, 1);
        b.emit_qstr(Op::ImportName, "");
        b.emit(Op::ImportStar);
        b.emit(Op::LoadConstNone);
        b.emit(Op::ReturnValue);
        let code = b
            .finish(ScopeInfo {
                name: "<module>".into(),
                filename: "t.py".into(),
                ..Default::default()
            })
            .unwrap();
        let bytes = to_bytes(&code, &ContainerOptions::default()).unwrap();
        assert!(bytes.windows(3).any(|w| w == [Op::ImportName as u8, 0x00, 0x01]));
        assert_eq!(read_mpy(&bytes).unwrap().code, code);
    }

    #[test]
    fn test_cache_flag_controls_extra_bytes() {
        let mut b = CodeBuilder::new(true);
        b.emit_qstr(Op::LoadName, "x");
        b.emit(Op::ReturnValue);
        let code = b
            .finish(ScopeInfo {
                name: "<module>".into(),
                filename: "t.py".into(),
                ..Default::default()
            })
            .unwrap();
        let options = ContainerOptions {
            features: FeatureFlags::UNICODE | FeatureFlags::CACHE,
            ..Default::default()
        };
        let bytes = to_bytes(&code, &options).unwrap();
        let file = read_mpy(&bytes).unwrap();
        assert!(file.options.cache_lookups());
        assert_eq!(file.code, code);
    }

    #[test]
    fn test_truncated_record_is_reported() {
        let bytes = to_bytes(&module(), &ContainerOptions::default()).unwrap();
        // Header plus the first byte of a two-byte record length.
        assert!(bytes[5] & 0x80 != 0);
        assert!(matches!(
            read_mpy(&bytes[..6]),
            Err(ContainerError::Truncated { what: "code record length" })
        ));
        for cut in 6..bytes.len() {
            assert!(read_mpy(&bytes[..cut]).is_err(), "cut at {} decoded", cut);
        }
    }

    #[test]
    fn test_malformed_records() {
        let mut bytes = to_bytes(&module(), &ContainerOptions::default()).unwrap();
        bytes.push(0);
        assert!(matches!(read_mpy(&bytes), Err(ContainerError::Corrupt(_))));

        let native = [b'M', 5, 1, 31, 32, 0x05];
        assert!(matches!(
            read_mpy(&native),
            Err(ContainerError::UnsupportedKind { kind: 1 })
        ));
    }

    #[test]
    fn test_oversized_counts_are_errors() {
        let huge_window = [b'M', 5, 1, 31, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        assert!(matches!(
            read_mpy(&huge_window),
            Err(ContainerError::Truncated { .. })
        ));

        let huge_record = [b'M', 5, 1, 31, 32, 0xff, 0xff, 0xff, 0xff, 0x7c, 0x00];
        assert!(read_mpy(&huge_record).is_err());
    }

    #[test]
    fn test_write_mpy_to_sink() {
        let code = module();
        let mut out = Vec::new();
        write_mpy(&mut out, &code, &ContainerOptions::default()).unwrap();
        let file = load_mpy(&mut out.as_slice()).unwrap();
        assert_eq!(file.code, code);
    }
}
