/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Clock-skew negotiation. The client sends its current timestamp plus the
//! accumulated offset; the server replies with the remaining difference.
//! Fold that in and repeat until the reply is inside the threshold, or give
//! up after a fixed number of rounds - a link whose latency swamps the
//! threshold can't be measured this way.

use crate::error::*;
use crate::transport::SyncTransport;
use error_support::debug;
use types::Timestamp;

const SKEW_THRESHOLD_MS: i64 = 500;
const MAX_ATTEMPTS: u32 = 10;

pub fn negotiate_skew(transport: &dyn SyncTransport) -> Result<i64> {
    let mut skew: i64 = 0;
    for attempt in 0..MAX_ATTEMPTS {
        let stamp = Timestamp::now().as_millis_i64() + skew;
        let reply = transport.get_time(stamp)?;
        skew += reply;
        debug!("skew attempt {}: reply {} ms, total {} ms", attempt, reply, skew);
        if reply.abs() < SKEW_THRESHOLD_MS {
            return Ok(skew);
        }
    }
    Err(Error::UnstableConnection)
}
