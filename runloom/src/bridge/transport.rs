//! Slot socket transport for server-worker IPC: one Unix domain socket per
//! worker slot, bound under a per-process temp directory.

use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;

/// Information passed to the worker process for connecting to slot sockets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildTransportInfo {
    pub dir: PathBuf,
    pub num_slots: usize,
}

/// Named socket transport using filesystem sockets.
///
/// Socket path format: `{temp_dir}/runloom-{pid}/slot-{n}.sock`
pub struct NamedSocketTransport {
    dir: PathBuf,
    sockets: Vec<UnixStream>,
    listeners: Vec<tokio::net::UnixListener>,
    is_parent: bool,
}

impl NamedSocketTransport {
    /// Create transport on the server side, binding listeners for the
    /// worker to connect to.
    pub async fn create(num_slots: usize) -> io::Result<(Self, ChildTransportInfo)> {
        use std::os::unix::net::UnixListener as StdUnixListener;
        use tokio::net::UnixListener;

        let dir = std::env::temp_dir().join(format!("runloom-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;

        tracing::debug!(dir = %dir.display(), num_slots, "Creating slot transport");

        let mut listeners = Vec::with_capacity(num_slots);
        for i in 0..num_slots {
            let path = dir.join(format!("slot-{}.sock", i));

            if path.exists() {
                std::fs::remove_file(&path)?;
            }

            let std_listener = StdUnixListener::bind(&path)?;
            std_listener.set_nonblocking(true)?;
            let listener = UnixListener::from_std(std_listener)?;

            tracing::trace!(slot = i, path = %path.display(), "Bound socket");
            listeners.push(listener);
        }

        let transport = Self {
            dir: dir.clone(),
            sockets: Vec::with_capacity(num_slots),
            listeners,
            is_parent: true,
        };

        let child_info = ChildTransportInfo {
            dir: dir.clone(),
            num_slots,
        };

        Ok((transport, child_info))
    }

    /// Accept connections from the worker on all slots.
    pub async fn accept_connections(&mut self, num_slots: usize) -> io::Result<()> {
        for i in 0..num_slots {
            let listener = &self.listeners[i];
            tracing::trace!(slot = i, "Waiting for worker connection");
            let (stream, _) = listener.accept().await?;
            self.sockets.push(stream);
            tracing::trace!(slot = i, "Worker connected");
        }

        self.listeners.clear();
        Ok(())
    }

    /// Connect from the worker side.
    pub async fn connect(dir: PathBuf, num_slots: usize) -> io::Result<Self> {
        let mut sockets = Vec::with_capacity(num_slots);

        for i in 0..num_slots {
            let path = dir.join(format!("slot-{}.sock", i));
            tracing::trace!(slot = i, path = %path.display(), "Connecting to socket");

            let stream = UnixStream::connect(&path).await?;
            sockets.push(stream);

            tracing::trace!(slot = i, "Connected");
        }

        Ok(Self {
            dir,
            sockets,
            listeners: Vec::new(),
            is_parent: false,
        })
    }

    pub fn slot_socket(&mut self, slot: usize) -> Option<&mut UnixStream> {
        self.sockets.get_mut(slot)
    }

    /// Returns owned sockets for splitting into read/write halves.
    pub fn drain_sockets(&mut self) -> Vec<UnixStream> {
        std::mem::take(&mut self.sockets)
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn num_slots(&self) -> usize {
        self.sockets.len()
    }

    pub fn cleanup(&mut self) -> io::Result<()> {
        if self.is_parent && self.dir.exists() {
            tracing::debug!(dir = %self.dir.display(), "Cleaning up socket directory");
            std::fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

impl Drop for NamedSocketTransport {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            tracing::warn!(error = %e, "Failed to cleanup socket directory");
        }
    }
}

/// Create transport on the server side.
pub async fn create_transport(
    num_slots: usize,
) -> io::Result<(NamedSocketTransport, ChildTransportInfo)> {
    NamedSocketTransport::create(num_slots).await
}

/// Connect on the worker side using information handed down by the server.
pub async fn connect_transport(info: ChildTransportInfo) -> io::Result<NamedSocketTransport> {
    NamedSocketTransport::connect(info.dir, info.num_slots).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_transport_info_roundtrips() {
        let info = ChildTransportInfo {
            dir: PathBuf::from("/tmp/runloom-123"),
            num_slots: 3,
        };
        let json = serde_json::to_string(&info).unwrap();
        let parsed: ChildTransportInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.dir, PathBuf::from("/tmp/runloom-123"));
        assert_eq!(parsed.num_slots, 3);
    }

    #[tokio::test]
    async fn create_and_connect_roundtrip() {
        let (mut server, info) = NamedSocketTransport::create(2).await.unwrap();

        let connect_task = tokio::spawn(async move { NamedSocketTransport::connect(info.dir, info.num_slots).await });

        server.accept_connections(2).await.unwrap();
        let mut client = connect_task.await.unwrap().unwrap();

        assert_eq!(server.num_slots(), 2);
        assert_eq!(client.num_slots(), 2);
        assert!(client.slot_socket(0).is_some());
    }
}
