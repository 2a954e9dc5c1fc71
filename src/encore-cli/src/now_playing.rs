//! The "now playing" state shared between a host player and its remotes.

use encore_remote::{Arguments, Interceptor, MemberTable, Remotable, ValueType};
use encore_core::RemotingDirection;
use serde_json::json;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct NowPlaying {
    interceptor: Interceptor,
    state: Mutex<State>,
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct State {
    pub title: String,
    pub volume: f64,
    pub position_seconds: u32,
}

impl NowPlaying {
    pub fn snapshot(&self) -> State {
        self.lock().clone()
    }

    pub fn set_title(&self, title: &str) {
        let title = title.to_string();
        let old = std::mem::replace(&mut self.lock().title, title.clone());
        self.interceptor.property_set("title", &old, &title);
    }

    pub fn set_volume(&self, volume: f64) {
        let volume = volume.clamp(0.0, 1.0);
        let old = std::mem::replace(&mut self.lock().volume, volume);
        self.interceptor.property_set("volume", &old, &volume);
    }

    /// Moves the playhead; every linked player seeks with it.
    pub fn seek(&self, position_seconds: u32) {
        self.interceptor
            .method_entered("seek", vec![json!(position_seconds)]);
        self.lock().position_seconds = position_seconds;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Remotable for NowPlaying {
    fn interceptor(&self) -> &Interceptor {
        &self.interceptor
    }

    fn members() -> MemberTable<Self> {
        MemberTable::new()
            .direction(RemotingDirection::BIDIRECTIONAL)
            .property("title", |np: &NowPlaying, title: String| np.set_title(&title))
            .tagged(RemotingDirection::HOST_TO_CLIENT)
            .property("volume", |np: &NowPlaying, volume: f64| np.set_volume(volume))
            .method(
                "seek",
                [ValueType::U32],
                ValueType::Unit,
                |np: &NowPlaying, args: &Arguments| {
                    np.seek(args.get(0)?);
                    Ok(())
                },
            )
    }
}
