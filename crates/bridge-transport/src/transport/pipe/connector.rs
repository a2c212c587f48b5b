//! Ways to open the local pipe

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Result;

/// Any bidirectional byte stream the pipe protocol can run over
pub trait PipeStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> PipeStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Opens a fresh connection to the telephony server's pipe
#[async_trait]
pub trait PipeConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn PipeStream>>;

    /// Human-readable endpoint, for logs
    fn describe(&self) -> String;
}

#[cfg(unix)]
pub use unix::UnixSocketConnector;

#[cfg(unix)]
mod unix {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::UnixStream;

    /// Connects to a Unix-domain socket
    #[derive(Debug, Clone)]
    pub struct UnixSocketConnector {
        path: PathBuf,
    }

    impl UnixSocketConnector {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self { path: path.into() }
        }
    }

    #[async_trait]
    impl PipeConnector for UnixSocketConnector {
        async fn connect(&self) -> Result<Box<dyn PipeStream>> {
            let stream = UnixStream::connect(&self.path).await?;
            Ok(Box::new(stream))
        }

        fn describe(&self) -> String {
            self.path.display().to_string()
        }
    }
}

#[cfg(windows)]
pub use windows::NamedPipeConnector;

#[cfg(windows)]
mod windows {
    use super::*;
    use tokio::net::windows::named_pipe::ClientOptions;

    /// Connects to a Windows named pipe such as `\\.\pipe\telephony`
    #[derive(Debug, Clone)]
    pub struct NamedPipeConnector {
        name: String,
    }

    impl NamedPipeConnector {
        pub fn new(name: impl Into<String>) -> Self {
            Self { name: name.into() }
        }
    }

    #[async_trait]
    impl PipeConnector for NamedPipeConnector {
        async fn connect(&self) -> Result<Box<dyn PipeStream>> {
            let client = ClientOptions::new().open(&self.name)?;
            Ok(Box::new(client))
        }

        fn describe(&self) -> String {
            self.name.clone()
        }
    }
}
