use derive_more::From;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    // -- Configuration
    Config(String),

    // -- Engine lifecycle
    /// The flow limiter was stopped while a caller was waiting on it.
    Stopped,
    AlreadyStarted,

    // -- Network
    InvalidHttpResponse(String),
    Timeout(String),
    Parse(String),

    // -- Externals
    #[from]
    Io(std::io::Error),

    #[from]
    Reqwest(reqwest::Error),

    #[from]
    Resolve(hickory_resolver::error::ResolveError),

    #[from]
    DnsProto(hickory_client::proto::error::ProtoError),

    #[from]
    DnsClient(hickory_client::error::ClientError),

    #[from]
    Tls(native_tls::Error),

    #[from]
    AddrParse(std::net::AddrParseError),

    #[from]
    CidrParse(ipnet::AddrParseError),

    #[from]
    Regex(regex::Error),

    #[from]
    Json(serde_json::Error),

    #[from]
    Join(tokio::task::JoinError),

    #[from]
    SystemTime(std::time::SystemTimeError),
}

// region:    --- Error Boilerplate

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for Error {}

// endregion: --- Error Boilerplate
