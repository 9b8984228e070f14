use crate::error;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

/// Split a `proto!address[!port]` dial string into its protocol and the
/// address the corresponding listener understands.
pub fn parse_proto(arg: &str) -> Option<(&str, String)> {
    let mut split = arg.split('!');
    let proto = split.next()?;

    match proto {
        "tcp" => {
            let (addr, port) = (split.next()?, split.next()?);
            Some((proto, format!("{}:{}", addr, port)))
        }
        "unix" => Some((proto, split.next()?.to_owned())),
        _ => None,
    }
}

#[test]
fn parse_proto_tcp() {
    assert_eq!(
        parse_proto("tcp!0.0.0.0!564"),
        Some(("tcp", "0.0.0.0:564".to_owned()))
    );
}

#[test]
fn parse_proto_unix() {
    assert_eq!(
        parse_proto("unix!/tmp/sock"),
        Some(("unix", "/tmp/sock".to_owned()))
    );
}

#[test]
fn parse_proto_unknown() {
    assert_eq!(parse_proto("9pfd!6!7"), None);
    assert_eq!(parse_proto("tcp!0.0.0.0"), None);
}
