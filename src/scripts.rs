//! Server-side scripts for multi-step state transitions.
//!
//! Every transition that reads and writes more than one key is evaluated
//! inside the store as a single unit; no component may simulate one with
//! multiple round-trips. The Lua sources live next to this module and are
//! compiled into the binary.

use redis::Script;

const RESERVE_LUA: &str = include_str!("lua/reserve.lua");
const RESERVE_LOST_LUA: &str = include_str!("lua/reserve_lost.lua");
const HEARTBEAT_LUA: &str = include_str!("lua/heartbeat.lua");
const ACKNOWLEDGE_LUA: &str = include_str!("lua/acknowledge.lua");
const REQUEUE_LUA: &str = include_str!("lua/requeue.lua");
const RELEASE_LUA: &str = include_str!("lua/release.lua");
const ELECT_MASTER_LUA: &str = include_str!("lua/elect_master.lua");
const TAKEOVER_MASTER_LUA: &str = include_str!("lua/takeover_master.lua");
const PUBLISH_QUEUE_LUA: &str = include_str!("lua/publish_queue.lua");
const RECORD_SUCCESS_LUA: &str = include_str!("lua/record_success.lua");
const POP_WARNINGS_LUA: &str = include_str!("lua/pop_warnings.lua");
const EMA_UPDATE_LUA: &str = include_str!("lua/ema_update.lua");

/// Compiled handles for every protocol script.
#[derive(Clone)]
pub struct Scripts {
    pub reserve: Script,
    pub reserve_lost: Script,
    pub heartbeat: Script,
    pub acknowledge: Script,
    pub requeue: Script,
    pub release: Script,
    pub elect_master: Script,
    pub takeover_master: Script,
    pub publish_queue: Script,
    pub record_success: Script,
    pub pop_warnings: Script,
    pub ema_update: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            reserve: Script::new(RESERVE_LUA),
            reserve_lost: Script::new(RESERVE_LOST_LUA),
            heartbeat: Script::new(HEARTBEAT_LUA),
            acknowledge: Script::new(ACKNOWLEDGE_LUA),
            requeue: Script::new(REQUEUE_LUA),
            release: Script::new(RELEASE_LUA),
            elect_master: Script::new(ELECT_MASTER_LUA),
            takeover_master: Script::new(TAKEOVER_MASTER_LUA),
            publish_queue: Script::new(PUBLISH_QUEUE_LUA),
            record_success: Script::new(RECORD_SUCCESS_LUA),
            pop_warnings: Script::new(POP_WARNINGS_LUA),
            ema_update: Script::new(EMA_UPDATE_LUA),
        }
    }

    /// Raw sources, for preloading with `SCRIPT LOAD` in tests.
    pub fn sources() -> [&'static str; 12] {
        [
            RESERVE_LUA,
            RESERVE_LOST_LUA,
            HEARTBEAT_LUA,
            ACKNOWLEDGE_LUA,
            REQUEUE_LUA,
            RELEASE_LUA,
            ELECT_MASTER_LUA,
            TAKEOVER_MASTER_LUA,
            PUBLISH_QUEUE_LUA,
            RECORD_SUCCESS_LUA,
            POP_WARNINGS_LUA,
            EMA_UPDATE_LUA,
        ]
    }
}

impl Default for Scripts {
    fn default() -> Self {
        Self::new()
    }
}
