//! Worker for an established serial connection.
//!
//! A session owns both directions of the connected stream: a read task that
//! forwards every chunk it receives, and a write task that performs queued
//! writes one at a time. Either direction failing ends the session with a
//! single `Disconnected` report; dropping the session aborts both tasks,
//! which closes the stream.

use std::{fmt, io};

use bluer::Address;
use log::{debug, warn};
use smallvec::SmallVec;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   sync::{mpsc, oneshot},
   task::JoinSet,
};

use crate::error::{Result, SerialError};

pub type Packet = SmallVec<[u8; 64]>;

/// Depth of the pending write queue
const WRITE_QUEUE_DEPTH: usize = 128;

/// Identifies one established session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      write!(f, "session#{}", self.0)
   }
}

/// Reports from a session to its manager.
#[derive(Debug)]
pub enum SessionReport {
   Received { session: SessionId, data: Packet },
   Disconnected { session: SessionId, cause: io::Error },
}

#[derive(Debug)]
enum Command {
   Send {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
}

/// Write half of a session.
///
/// Waiting for queue capacity happens here, on the caller's task, so a peer
/// that stops reading never holds up the owner of the session. Writes fail
/// with `ConnectionLost` once the session is gone.
#[derive(Debug, Clone)]
pub struct SessionWriter {
   tx: mpsc::Sender<Command>,
}

impl SessionWriter {
   /// Queues `data` and resolves once it has been written.
   pub async fn write(&self, data: Packet) -> Result<()> {
      let (then, done) = oneshot::channel();
      self
         .tx
         .send(Command::Send { data, then })
         .await
         .map_err(|_| SerialError::ConnectionLost)?;
      done.await.map_err(|_| SerialError::ConnectionLost)?
   }
}

#[derive(Debug)]
pub struct SessionWorker {
   id: SessionId,
   address: Address,
   tx: mpsc::Sender<Command>,
   jset: JoinSet<()>,
}

impl Drop for SessionWorker {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

impl SessionWorker {
   /// Takes ownership of `link` and starts both directions.
   pub fn spawn<L>(
      id: SessionId,
      address: Address,
      link: L,
      buffer_size: usize,
      reports: mpsc::Sender<SessionReport>,
   ) -> Self
   where
      L: AsyncRead + AsyncWrite + Send + Unpin + 'static,
   {
      let (reader, writer) = tokio::io::split(link);
      let (cmd_tx, cmd_rx) = mpsc::channel(WRITE_QUEUE_DEPTH);

      let mut jset = JoinSet::new();
      jset.spawn(read_loop(
         id,
         address,
         reader,
         buffer_size.max(1),
         reports.clone(),
      ));
      jset.spawn(write_loop(id, address, writer, cmd_rx, reports));

      Self {
         id,
         address,
         tx: cmd_tx,
         jset,
      }
   }

   pub const fn id(&self) -> SessionId {
      self.id
   }

   pub const fn address(&self) -> Address {
      self.address
   }

   pub fn writer(&self) -> SessionWriter {
      SessionWriter {
         tx: self.tx.clone(),
      }
   }

   /// Closes the stream. Both tasks stop without reporting.
   pub fn cancel(self) {
      debug!("Cancelling {} with {}", self.id, self.address);
   }
}

async fn read_loop<R>(
   session: SessionId,
   adr: Address,
   mut reader: R,
   buffer_size: usize,
   reports: mpsc::Sender<SessionReport>,
) where
   R: AsyncRead + Unpin,
{
   let mut buf = vec![0u8; buffer_size];
   let cause = loop {
      match reader.read(&mut buf).await {
         Ok(0) => break io::Error::new(io::ErrorKind::UnexpectedEof, "remote closed the stream"),
         Ok(n) => {
            let recvd = &buf[..n];
            debug!("← {adr}: {}", hex::encode(recvd));
            let report = SessionReport::Received {
               session,
               data: Packet::from_slice(recvd),
            };
            if reports.send(report).await.is_err() {
               return;
            }
         },
         Err(e) => break e,
      }
   };
   warn!("Read from {adr} failed: {cause}");
   let _ = reports
      .send(SessionReport::Disconnected { session, cause })
      .await;
}

async fn write_loop<W>(
   session: SessionId,
   adr: Address,
   mut writer: W,
   mut rx: mpsc::Receiver<Command>,
   reports: mpsc::Sender<SessionReport>,
) where
   W: AsyncWrite + Unpin,
{
   while let Some(cmd) = rx.recv().await {
      match cmd {
         Command::Send { data, then } => {
            debug!("→ {adr}: {}", hex::encode(&data));
            let written = match writer.write_all(&data).await {
               Ok(()) => writer.flush().await,
               Err(e) => Err(e),
            };
            if let Err(cause) = written {
               warn!("Write to {adr} failed: {cause}");
               let _ = then.send(Err(SerialError::ConnectionLost));
               let _ = reports
                  .send(SessionReport::Disconnected { session, cause })
                  .await;
               return;
            }
            let _ = then.send(Ok(()));
         },
      }
   }
}
