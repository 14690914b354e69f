//! Blocking wrapper around [`crate::Client`] for callers without an async runtime.
//!
//! Each client owns a small runtime that keeps the background reader running between calls.
//! Do not create or drop one from inside an async context.

use crate::{ClientConfig, ConnectionState, PacketType};
use tokio::runtime::Runtime;

pub struct Client {
    runtime: Runtime,
    client: crate::Client,
}

impl Client {
    pub fn new() -> crate::Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("rcon-reader")
            .enable_all()
            .build()?;

        Ok(Client {
            runtime,
            client: crate::Client::new(),
        })
    }

    pub fn connect(
        host: &str,
        port: u16,
        password: &str,
        config: ClientConfig,
    ) -> crate::Result<Self> {
        let client = Self::new()?;
        client.setup(host, port, password, config)?;
        Ok(client)
    }

    pub fn setup(
        &self,
        host: &str,
        port: u16,
        password: &str,
        config: ClientConfig,
    ) -> crate::Result<()> {
        self.runtime.block_on(self.client.setup(host, port, password, config))
    }

    pub fn send_command(&self, command: &str) -> String {
        self.runtime.block_on(self.client.send_command(command))
    }

    pub fn send_message(&self, kind: PacketType, text: &str) -> String {
        self.runtime.block_on(self.client.send_message(kind, text))
    }

    pub fn fire_and_forget(&self, kind: PacketType, text: &str) {
        let _guard = self.runtime.enter();
        drop(self.client.fire_and_forget(kind, text));
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    pub fn reconnect_count(&self) -> u64 {
        self.client.reconnect_count()
    }

    pub fn dispose(&self) {
        self.runtime.block_on(self.client.dispose())
    }
}
