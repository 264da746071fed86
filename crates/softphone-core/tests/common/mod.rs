//! Shared harness for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::TryRecvError};

use rvoip_softphone_core::mock::{EngineCall, MockEngine, MockOp};
use rvoip_softphone_core::{
    EngineEvent, LineId, PhoneConfig, PhoneEvent, RemoteSessionState, SessionHandle, Softphone,
};

pub struct Harness {
    pub engine: Arc<MockEngine>,
    pub phone: Arc<Softphone>,
    pub events: broadcast::Receiver<PhoneEvent>,
}

impl Harness {
    /// Events published since the last drain
    pub fn drain(&mut self) -> Vec<PhoneEvent> {
        let mut events = Vec::new();
        loop {
            match self.events.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }

    /// Session of the most recent invite sent to `target`
    pub fn invited_session(&self, target: &str) -> SessionHandle {
        self.engine
            .calls_of(MockOp::Invite)
            .into_iter()
            .rev()
            .find_map(|call| match call {
                EngineCall::Invite { target: t, session } if t == target => Some(session),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no invite sent to {}", target))
    }

    pub fn remote(&self, session: &SessionHandle, state: RemoteSessionState) {
        self.engine.emit(EngineEvent::SessionStateChanged {
            session: session.clone(),
            state,
        });
    }

    /// Place a call and have the remote side answer it
    pub async fn established_call(&self, target: &str) -> LineId {
        let info = self.phone.place_call(target).await.unwrap();
        let session = self.invited_session(target);
        self.remote(&session, RemoteSessionState::Accepted);
        settle().await;
        info.line
    }

    pub fn notify(&self, extension: &str, body: &str) {
        self.engine.emit(EngineEvent::NotificationReceived {
            extension: extension.to_string(),
            body: body.to_string(),
            expires: None,
            terminated: false,
        });
    }

    pub fn incoming(&self, session: &str, from: &str) {
        self.engine.emit(EngineEvent::InviteReceived {
            session: SessionHandle::new(session),
            from: from.to_string(),
            display_name: None,
        });
    }
}

pub fn config() -> PhoneConfig {
    PhoneConfig::new("wss://pbx.test:8089/ws").with_credentials("1001", "secret")
}

pub fn line(number: u8) -> LineId {
    LineId::new(number).unwrap()
}

/// Build a phone on a fresh mock engine without connecting it
pub fn harness(config: PhoneConfig) -> Harness {
    let engine = Arc::new(MockEngine::new());
    let phone = Softphone::builder(config).engine(engine.clone()).build().unwrap();
    let events = phone.subscribe_events();
    Harness { engine, phone, events }
}

/// Build, connect and register
pub async fn connected(config: PhoneConfig) -> Harness {
    let harness = harness(config);
    harness.phone.connect().await.unwrap();
    settle().await;
    harness
}

/// Let spawned tasks run
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn dialog_info(state: &str) -> String {
    format!(
        r#"<?xml version="1.0"?>
<dialog-info xmlns="urn:ietf:params:xml:ns:dialog-info" version="1" state="full" entity="sip:201@pbx.test">
  <dialog id="a1" direction="recipient"><state>{}</state></dialog>
</dialog-info>"#,
        state
    )
}
