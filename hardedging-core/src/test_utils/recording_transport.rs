//! A transport that does nothing but hand every command to the test

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core_mesh::transport::{Transport, TransportCommand, TransportError};

/// Records commands; the test plays the remote side by injecting events
pub struct RecordingTransport {
    commands_tx: mpsc::UnboundedSender<TransportCommand>,
}

impl RecordingTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportCommand>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (RecordingTransport { commands_tx }, commands_rx)
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn handle_command(&self, command: TransportCommand) -> Result<(), TransportError> {
        let _ = self.commands_tx.send(command);
        Ok(())
    }
}
