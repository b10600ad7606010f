//! `gen+` - a sequence generator prefix
//!
//! Every Data message arriving from the inner channel grants a window of
//! `count` generated messages; the prefix raises `PROCESS|PENDING` and
//! emits one sequenced empty Data message per `process()` call until the
//! window is exhausted. Load generation for drivers and benchmarks.

use std::time::Duration;

use wirelink_config::{Config, Url};
use wirelink_core::{DCaps, Msg};

use crate::chan::{Base, ChannelImpl, ProcessPolicy};
use crate::error::Result;
use crate::prefix::{Prefix, PrefixHook};

pub struct Gen {
    count: i64,
    seq: i64,
    end: i64,
}

impl Default for Gen {
    fn default() -> Self {
        Self {
            count: 100_000,
            seq: -1,
            end: -1,
        }
    }
}

impl Gen {
    pub fn boxed() -> Box<dyn ChannelImpl> {
        Box::new(Prefix::new(Self::default()))
    }
}

impl PrefixHook for Gen {
    fn process_policy(&self) -> ProcessPolicy {
        ProcessPolicy::Custom
    }

    fn init(&mut self, _base: &mut Base, url: &Url) -> Result<()> {
        self.count = url.config().get_i64("count", 100_000)?;
        Ok(())
    }

    fn open(&mut self, _base: &mut Base, _params: &Config) -> Result<()> {
        self.seq = -1;
        self.end = -1;
        Ok(())
    }

    fn on_data(&mut self, base: &mut Base, _msg: &Msg) -> Result<()> {
        // Inner data only widens the generation window.
        self.end += self.count;
        base.update_dcaps(DCaps::PROCESS | DCaps::PENDING, DCaps::empty());
        Ok(())
    }

    fn process(&mut self, base: &mut Base, _timeout: Duration, _flags: u32) -> Result<bool> {
        if self.seq == self.end {
            base.update_dcaps(DCaps::empty(), DCaps::PROCESS | DCaps::PENDING);
            return Ok(false);
        }
        self.seq += 1;
        base.callback_data(Msg::data(0, self.seq, bytes::Bytes::new()));
        Ok(true)
    }
}
