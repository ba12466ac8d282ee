// Shared plumbing for the three roles: framed command IO over TCP and
// service observability setup.
pub mod framed;
pub mod observability;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("link io error")]
    Io(#[from] std::io::Error),
    #[error("wire protocol error")]
    Wire(#[from] lattice_wire::Error),
}

impl Error {
    /// True when the error indicates a peer protocol violation rather
    /// than a transport failure. Both close the connection; link
    /// supervisors report violations at a higher severity before
    /// redialing.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Wire(_))
    }
}
