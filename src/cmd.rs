//! Command construction and multi-bulk wire formatting.

use crate::types::{ErrorKind, RouterResult};

/// The packed one-word request that precedes a redirected command on an ASK
/// excursion.
pub(crate) const ASKING: &[u8] = b"*1\r\n$6\r\nASKING\r\n";

/// Conversion of a single command argument into its wire bytes.
pub trait ToArg {
    /// Appends the argument bytes to `out`.
    fn write_arg(&self, out: &mut Vec<u8>);
}

impl ToArg for &[u8] {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl ToArg for Vec<u8> {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

impl ToArg for &str {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToArg for String {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

macro_rules! itoa_to_arg {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn write_arg(&self, out: &mut Vec<u8>) {
                    let mut buf = itoa::Buffer::new();
                    out.extend_from_slice(buf.format(*self).as_bytes());
                }
            }
        )*
    };
}

itoa_to_arg!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize);

macro_rules! ryu_to_arg {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn write_arg(&self, out: &mut Vec<u8>) {
                    let mut buf = ryu::Buffer::new();
                    out.extend_from_slice(buf.format(*self).as_bytes());
                }
            }
        )*
    };
}

ryu_to_arg!(f32, f64);

impl ToArg for &String {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.as_bytes());
    }
}

impl ToArg for &Vec<u8> {
    fn write_arg(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }
}

/// A command builder.
///
/// Commands are assembled argument by argument and packed into the wire
/// protocol's multi-bulk request format:
///
/// ```rust
/// use redis_cluster_router::cmd;
///
/// let packed = cmd("SET").arg("foo").arg(42).get_packed_command();
/// assert_eq!(packed, b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$2\r\n42\r\n");
/// ```
#[derive(Clone, Debug, Default)]
pub struct Cmd {
    args: Vec<Vec<u8>>,
}

/// Shortcut for creating a command with the given name.
pub fn cmd(name: &str) -> Cmd {
    let mut rv = Cmd::new();
    rv.arg(name);
    rv
}

impl Cmd {
    /// Creates an empty command.
    pub fn new() -> Cmd {
        Cmd { args: vec![] }
    }

    /// Appends an argument.
    pub fn arg<T: ToArg>(&mut self, arg: T) -> &mut Cmd {
        let mut bytes = Vec::new();
        arg.write_arg(&mut bytes);
        self.args.push(bytes);
        self
    }

    /// Returns the packed wire representation of the command.
    pub fn get_packed_command(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_packed_command(&mut out);
        out
    }

    /// Writes the packed wire representation into `out`.
    pub fn write_packed_command(&self, out: &mut Vec<u8>) {
        write_command(out, self.args.iter().map(|arg| arg.as_slice()))
    }

    /// Iterates over the raw arguments.
    pub fn args_iter(&self) -> impl Iterator<Item = &[u8]> {
        self.args.iter().map(|arg| arg.as_slice())
    }
}

/// Packs an argv-style command.
///
/// Fails with `InvalidArgument` when `argv` is empty or the command word is
/// empty.
pub fn pack_command<A: AsRef<[u8]>>(argv: &[A]) -> RouterResult<Vec<u8>> {
    if argv.is_empty() || argv[0].as_ref().is_empty() {
        fail!((ErrorKind::InvalidArgument, "Cannot pack an empty command"));
    }
    let mut out = Vec::new();
    write_command(&mut out, argv.iter().map(|arg| arg.as_ref()));
    Ok(out)
}

fn write_command<'a, I: ExactSizeIterator<Item = &'a [u8]>>(out: &mut Vec<u8>, args: I) {
    let mut buf = itoa::Buffer::new();
    out.push(b'*');
    out.extend_from_slice(buf.format(args.len()).as_bytes());
    out.extend_from_slice(b"\r\n");
    for arg in args {
        out.push(b'$');
        out.extend_from_slice(buf.format(arg.len()).as_bytes());
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// True when the packed command opens a subscription, in which case the
/// connection it is written to starts delivering unsolicited messages.
pub(crate) fn is_subscribe_command(packed: &[u8]) -> bool {
    match first_word(packed) {
        Some(word) => {
            word.eq_ignore_ascii_case(b"SUBSCRIBE") || word.eq_ignore_ascii_case(b"PSUBSCRIBE")
        }
        None => false,
    }
}

// Extracts the first bulk argument of a packed multi-bulk request.
fn first_word(packed: &[u8]) -> Option<&[u8]> {
    if packed.first() != Some(&b'*') {
        return None;
    }
    let header_end = find_crlf(packed, 1)?;
    if packed.get(header_end) != Some(&b'$') {
        return None;
    }
    let len_end = find_crlf(packed, header_end + 1)?;
    let len: usize = std::str::from_utf8(&packed[header_end + 1..len_end - 2])
        .ok()?
        .parse()
        .ok()?;
    packed.get(len_end..len_end + len)
}

// Position just past the first CRLF at or after `from`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|pos| from + pos + 2)
}
