//! The command line type: a name plus its arguments, and the request
//! encoding shared by every command.

use bytes::{Bytes, BytesMut};

/// A single command as it will appear on the wire: the command name followed
/// by its arguments. Immutable once built; created per call and discarded
/// after the request is encoded.
///
/// Requests are always encoded as an array of bulk strings
/// (`*<argc>\r\n` then `$<len>\r\n<bytes>\r\n` per argument, name first).
/// The explicit length framing is what allows arguments to contain
/// delimiter bytes.
#[derive(Clone, Debug)]
pub struct CommandLine {
    name: String,
    args: Vec<Bytes>,
}

impl CommandLine {
    /// Create a command line with no arguments yet.
    pub fn new(name: impl Into<String>) -> CommandLine {
        CommandLine {
            name: name.into(),
            args: vec![],
        }
    }

    /// Append a raw byte-string argument.
    pub fn arg(mut self, arg: impl Into<Bytes>) -> CommandLine {
        self.args.push(arg.into());
        self
    }

    /// Append a text argument, copied into the command line.
    pub fn arg_text(self, arg: &str) -> CommandLine {
        self.arg(Bytes::copy_from_slice(arg.as_bytes()))
    }

    /// Append an integer argument in its canonical decimal form.
    pub fn arg_int(self, arg: i64) -> CommandLine {
        self.arg(Bytes::from(arg.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Bytes] {
        &self.args
    }

    /// Encode the request into `dst`.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.extend_from_slice(format!("*{}\r\n", self.args.len() + 1).as_bytes());
        put_bulk(dst, self.name.as_bytes());
        for arg in &self.args {
            put_bulk(dst, arg);
        }
    }
}

fn put_bulk(dst: &mut BytesMut, data: &[u8]) {
    dst.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
    dst.extend_from_slice(data);
    dst.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_set_request_bit_exact() {
        let cmd = CommandLine::new("SET").arg_text("foo").arg_text("bar");

        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    }

    #[test]
    fn arguments_may_contain_delimiter_bytes() {
        let cmd = CommandLine::new("SET")
            .arg_text("key")
            .arg(Bytes::from_static(b"a\r\nb"));

        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        assert_eq!(&buf[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$4\r\na\r\nb\r\n");
    }

    #[test]
    fn integer_arguments_use_canonical_form() {
        let cmd = CommandLine::new("EXPIRE").arg_text("key").arg_int(60);

        let mut buf = BytesMut::new();
        cmd.encode(&mut buf);
        assert_eq!(&buf[..], b"*3\r\n$6\r\nEXPIRE\r\n$3\r\nkey\r\n$2\r\n60\r\n");
    }
}
