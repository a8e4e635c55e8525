//! Client metadata test: a fixed sequence of labeled strings sent over the
//! control channel.

use super::{TestContext, TestHandler};
use crate::output::StatusUpdate;
use ndt_protocol::{
    CLIENT_VERSION, META_CLIENT_APPLICATION, META_CLIENT_BROWSER, META_CLIENT_OS,
    META_CLIENT_VERSION, Message, TestKind,
};
use tracing::{debug, info};

/// Descriptive strings reported to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDescriptors {
    pub os_name: String,
    pub browser: String,
    pub client_version: String,
    pub application: String,
}

pub trait MetadataSource: Send + Sync {
    fn descriptors(&self) -> ClientDescriptors;
}

impl MetadataSource for ClientDescriptors {
    fn descriptors(&self) -> ClientDescriptors {
        self.clone()
    }
}

/// Describes the machine and build this client runs on
#[derive(Debug, Clone)]
pub struct SystemMetadata {
    application: String,
}

impl SystemMetadata {
    pub fn new(application: impl Into<String>) -> Self {
        Self {
            application: application.into(),
        }
    }
}

impl MetadataSource for SystemMetadata {
    fn descriptors(&self) -> ClientDescriptors {
        ClientDescriptors {
            os_name: format!("{} {}", std::env::consts::OS, std::env::consts::ARCH),
            browser: format!("ndt-client/{}", env!("CARGO_PKG_VERSION")),
            client_version: CLIENT_VERSION.to_string(),
            application: self.application.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct MetadataTest;

impl MetadataTest {
    pub fn new() -> Self {
        Self
    }
}

impl TestHandler for MetadataTest {
    fn kind(&self) -> TestKind {
        TestKind::Metadata
    }

    fn prepare(&mut self, _message: &Message, _ctx: &mut TestContext<'_>) {
        debug!("Metadata test: prepare");
    }

    fn start(&mut self, ctx: &mut TestContext<'_>) {
        let meta = ctx.env.metadata.descriptors();
        info!("Metadata test: sending client descriptors");
        ctx.sink.status(&StatusUpdate::TestStarted(TestKind::Metadata));

        for (label, value) in [
            (META_CLIENT_OS, &meta.os_name),
            (META_CLIENT_BROWSER, &meta.browser),
            (META_CLIENT_VERSION, &meta.client_version),
            (META_CLIENT_APPLICATION, &meta.application),
        ] {
            ctx.outbound.send(Message::test_data(format!("{}{}", label, value)));
        }
        ctx.outbound.send(Message::test_data(""));
    }

    fn finalize(&mut self, ctx: &mut TestContext<'_>) {
        ctx.sink.status(&StatusUpdate::TestFinished {
            test: TestKind::Metadata,
            kbps: None,
        });
    }
}
