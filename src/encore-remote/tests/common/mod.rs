#![allow(dead_code)]

use encore_core::{RemotingDirection, RemotingMode};
use encore_remote::{
    Arguments, Interceptor, InvokeError, MemberRemote, MemberTable, MemoryBus, MemoryHandler,
    MessageHandler, Remotable, RemoteOptions, RemoteValue, ValueType,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A cue point inside a track.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cue {
    pub title: String,
    pub position: u32,
}

impl RemoteValue for Cue {
    fn value_type() -> ValueType {
        ValueType::Named("Cue".into())
    }
}

/// A playback deck with one member of each remoting flavour.
#[derive(Default)]
pub struct Deck {
    interceptor: Interceptor,
    volume: Mutex<f64>,
    notes: Mutex<String>,
    crossfade: Mutex<u32>,
    balance: Mutex<i32>,
    cue: Mutex<Cue>,
    loaded: Mutex<Vec<(String, u32)>>,
}

impl Deck {
    pub fn volume(&self) -> f64 {
        *self.volume.lock().unwrap()
    }

    pub fn set_volume(&self, volume: f64) {
        let old = std::mem::replace(&mut *self.volume.lock().unwrap(), volume);
        self.interceptor.property_set("volume", &old, &volume);
    }

    pub fn notes(&self) -> String {
        self.notes.lock().unwrap().clone()
    }

    pub fn set_notes(&self, notes: &str) {
        let notes = notes.to_string();
        let old = std::mem::replace(&mut *self.notes.lock().unwrap(), notes.clone());
        self.interceptor.property_set("notes", &old, &notes);
    }

    pub fn crossfade(&self) -> u32 {
        *self.crossfade.lock().unwrap()
    }

    pub fn set_crossfade(&self, seconds: u32) {
        let old = std::mem::replace(&mut *self.crossfade.lock().unwrap(), seconds);
        self.interceptor.property_set("crossfade", &old, &seconds);
    }

    pub fn balance(&self) -> i32 {
        *self.balance.lock().unwrap()
    }

    pub fn set_balance(&self, balance: i32) {
        let old = std::mem::replace(&mut *self.balance.lock().unwrap(), balance);
        self.interceptor.property_set("balance", &old, &balance);
    }

    pub fn cue(&self) -> Cue {
        self.cue.lock().unwrap().clone()
    }

    pub fn set_cue(&self, cue: Cue) {
        let old = std::mem::replace(&mut *self.cue.lock().unwrap(), cue.clone());
        self.interceptor.property_set("cue", &old, &cue);
    }

    /// Skips ahead locally; peers applying the call panic.
    pub fn scratch(&self) {
        self.interceptor.method_entered("scratch", Vec::new());
    }

    pub fn loaded(&self) -> Vec<(String, u32)> {
        self.loaded.lock().unwrap().clone()
    }

    pub fn load(&self, title: &str, position: u32) {
        self.interceptor
            .method_entered("load", vec![json!(title), json!(position)]);
        self.loaded.lock().unwrap().push((title.to_string(), position));
    }

    pub fn eject(&self) -> Result<(), InvokeError> {
        self.interceptor.method_entered("eject", Vec::new());
        let err = io::Error::new(io::ErrorKind::Other, "tray jammed");
        self.interceptor.method_failed("eject", &err);
        Err(Box::new(err))
    }
}

impl Remotable for Deck {
    fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new()
            .property("volume", |deck: &Deck, volume: f64| deck.set_volume(volume))
            .tagged(RemotingDirection::BIDIRECTIONAL)
            .property("notes", |deck: &Deck, notes: String| deck.set_notes(&notes))
            .property("crossfade", |deck: &Deck, seconds: u32| deck.set_crossfade(seconds))
            .tagged(RemotingDirection::HOST_TO_CLIENT)
            .property("balance", |deck: &Deck, balance: i32| deck.set_balance(balance))
            .tagged(RemotingDirection::CLIENT_TO_HOST)
            .property("cue", |deck: &Deck, cue: Cue| deck.set_cue(cue))
            .tagged(RemotingDirection::BIDIRECTIONAL)
            .method(
                "load",
                [ValueType::String, ValueType::U32],
                ValueType::Unit,
                |deck: &Deck, args: &Arguments| {
                    deck.load(&args.get::<String>(0)?, args.get(1)?);
                    Ok(())
                },
            )
            .tagged(RemotingDirection::BIDIRECTIONAL)
            .method("eject", [], ValueType::Unit, |deck: &Deck, _: &Arguments| deck.eject())
            .tagged(RemotingDirection::BIDIRECTIONAL)
            .method(
                "cue_up",
                [Cue::value_type()],
                ValueType::Unit,
                |deck: &Deck, args: &Arguments| {
                    deck.set_cue(args.get(0)?);
                    Ok(())
                },
            )
            .tagged(RemotingDirection::BIDIRECTIONAL)
            .method("scratch", [], ValueType::Unit, |_: &Deck, _: &Arguments| {
                panic!("needle skipped")
            })
            .tagged(RemotingDirection::BIDIRECTIONAL)
    }
}

/// Two decks linked over one in-memory bus.
pub struct Pair {
    pub bus: MemoryBus,
    pub host_handler: Arc<MemoryHandler>,
    pub client_handler: Arc<MemoryHandler>,
    pub host: MemberRemote<Deck>,
    pub client: MemberRemote<Deck>,
}

pub async fn link(id: &str, host_mode: RemotingMode, client_mode: RemotingMode) -> Pair {
    link_with(id, id, host_mode, client_mode, RemoteOptions::default()).await
}

pub async fn link_with(
    host_id: &str,
    client_id: &str,
    host_mode: RemotingMode,
    client_mode: RemotingMode,
    options: RemoteOptions,
) -> Pair {
    let bus = MemoryBus::new();
    let host_handler = bus.handler(host_mode);
    let client_handler = bus.handler(client_mode);
    let host = MemberRemote::attach(
        Arc::new(Deck::default()),
        host_id,
        Some(host_handler.clone() as Arc<dyn MessageHandler>),
        options.clone(),
    )
    .await
    .unwrap();
    let client = MemberRemote::attach(
        Arc::new(Deck::default()),
        client_id,
        Some(client_handler.clone() as Arc<dyn MessageHandler>),
        options,
    )
    .await
    .unwrap();
    Pair {
        bus,
        host_handler,
        client_handler,
        host,
        client,
    }
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within two seconds");
}

/// Gives spawned tasks time to run when asserting that nothing happens.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
