use crate::records::{network_key, AttributionRecord};
use crate::window::{attribution_window, month_abbrev};
use chrono::NaiveDate;
use log::debug;
use std::collections::HashMap;

/// Attribution events of one `key_af`, collapsed into a single row.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AttributionSummary {
    pub key_af: String,
    pub install_time: Option<NaiveDate>,
    pub client: Option<String>,
    pub app_id: Option<String>,
    pub media_source: Option<String>,
    pub ad_type_af: Option<String>,
    pub adset: Option<String>,
    pub campaign_af: Option<String>,
    pub site_af: Option<String>,
    pub install_af: i64,
    pub reg_af: i64,
    pub deposit_af: i64,
}

impl AttributionSummary {
    pub fn month_af(&self) -> Option<String> {
        self.install_time.map(month_abbrev)
    }

    fn absorb(&mut self, record: AttributionRecord) {
        fill(&mut self.install_time, record.install_time);
        fill(&mut self.client, record.client);
        fill(&mut self.app_id, record.app_id);
        fill(&mut self.media_source, record.media_source);
        fill(&mut self.ad_type_af, record.ad_type_af);
        fill(&mut self.adset, record.adset);
        fill(&mut self.campaign_af, record.campaign_af);
        fill(&mut self.site_af, record.site_af);

        self.install_af += i64::from(record.event_name == "install");
        self.reg_af += i64::from(record.reg_af);
        self.deposit_af += i64::from(record.deposit_af);
    }
}

fn fill<T>(slot: &mut Option<T>, value: Option<T>) {
    if slot.is_none() {
        *slot = value;
    }
}

/// Builds the attribution key from the install day, campaign and site.
pub fn attribution_key(record: &AttributionRecord, install_day: NaiveDate) -> String {
    network_key(
        install_day,
        record.campaign_af.as_deref().unwrap_or(""),
        record.site_af.as_deref().unwrap_or(""),
    )
}

/// Whether the event happened between the first day of the install month
/// and the end of the grace period after it.
pub fn within_attribution_window(record: &AttributionRecord) -> bool {
    let (Some(install), Some(event)) = (record.install_time, record.event_time) else {
        return false;
    };

    attribution_window(install).is_some_and(|(start, end)| start <= event && event <= end)
}

/// Folds attribution records, fed chunk by chunk, into one summary per key.
/// Keys keep the order in which they were first seen.
#[derive(Debug, Default)]
pub struct AttributionAggregator {
    index: HashMap<String, usize>,
    summaries: Vec<AttributionSummary>,
    discarded: usize,
}

impl AttributionAggregator {
    pub fn push(&mut self, record: AttributionRecord) {
        if !within_attribution_window(&record) {
            self.discarded += 1;
            return;
        }
        let Some(install_day) = record.install_time else {
            self.discarded += 1;
            return;
        };

        let key = attribution_key(&record, install_day);
        let position = match self.index.get(&key) {
            Some(position) => *position,
            None => {
                self.summaries.push(AttributionSummary {
                    key_af: key.clone(),
                    ..Default::default()
                });
                self.index.insert(key, self.summaries.len() - 1);
                self.summaries.len() - 1
            }
        };

        self.summaries[position].absorb(record);
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = AttributionRecord>) {
        for record in records {
            self.push(record);
        }
    }

    /// Number of records dropped because they fell outside their
    /// attribution window.
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    pub fn finish(self) -> Vec<AttributionSummary> {
        debug!(
            "Aggregated attribution into {} keys, {} events outside their window",
            self.summaries.len(),
            self.discarded
        );
        self.summaries
    }
}
