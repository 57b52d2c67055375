use crate::items::TimelineFilter;
use crate::ledger::{authorize, QuotaHolder};
use chrono::{DateTime, Utc};
use quotaholder_core::error::QuotaError;
use quotaholder_core::objects::{ProvisionLog, ResolutionKind};
use quotaholder_storage_impl::LogCursor;
use std::collections::HashSet;

impl QuotaHolder {
    /// Accepted transfers issued in `(after, before]`, oldest first.
    ///
    /// An entry is visible when its source or its target holding matches a
    /// filter whose key unlocks the entity. Filters with a wrong key or an
    /// unknown entity are ignored.
    pub fn get_timeline(
        &self,
        after: DateTime<Utc>,
        before: DateTime<Utc>,
        filters: &[TimelineFilter],
    ) -> Result<Vec<ProvisionLog>, QuotaError> {
        if after >= before {
            return Ok(Vec::new());
        }
        let chunk = self.config().timeline_chunk;

        self.transact("get_timeline", |tx| {
            let mut allowed = HashSet::new();
            for filter in filters {
                match authorize(tx, &filter.entity, &filter.key) {
                    Ok(_) => {
                        allowed.insert((filter.entity.clone(), filter.resource.clone()));
                    }
                    Err(err) if err.is_rejection() => {
                        log::debug!("get_timeline: ignoring filter on {}: {}", filter.entity, err);
                    }
                    Err(err) => return Err(err),
                }
            }
            if allowed.is_empty() {
                return Ok(Vec::new());
            }

            let visible = |entry: &ProvisionLog| {
                entry.resolution() == Some(ResolutionKind::Accept)
                    && (allowed.contains(&(entry.source.clone(), entry.resource.clone()))
                        || allowed.contains(&(entry.target.clone(), entry.resource.clone())))
            };

            let mut timeline = Vec::new();
            let mut cursor = LogCursor::after(after);
            loop {
                let entries = tx.scan_provision_logs(cursor, before, chunk)?;
                let last = match entries.last() {
                    Some(last) => LogCursor::at(last),
                    None => break,
                };
                let complete = entries.len() < chunk;
                timeline.extend(entries.into_iter().filter(|e| visible(e)));
                if complete {
                    break;
                }
                cursor = last;
            }
            Ok(timeline)
        })
    }
}
