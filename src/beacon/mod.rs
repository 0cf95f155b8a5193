use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::debug;

use crate::config::BeaconConfig;

/// Maximum validator ids per state query, keeps request URLs bounded.
const VALIDATOR_BATCH_SIZE: usize = 64;

/// Default SLOTS_PER_EPOCH until the chain spec has been fetched.
const DEFAULT_SLOTS_PER_EPOCH: u64 = 32;

const HEAD_HEADER_PATH: &str = "/eth/v1/beacon/headers/head";
const HEAD_FINALITY_PATH: &str = "/eth/v1/beacon/states/head/finality_checkpoints";

/// Beacon chain head reference used to pin balance lookups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeaconHead {
    pub slot: u64,
    pub epoch: u64,
    pub finalized_epoch: u64,
    pub justified_epoch: u64,
    pub previous_justified_epoch: u64,
}

/// Beacon chain spec.
#[derive(Debug, Clone, Copy)]
pub struct SpecResponse {
    pub seconds_per_slot: u64,
    pub slots_per_epoch: u64,
}

/// Callback type for recording beacon request metrics.
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

/// Beacon node API client trait.
pub trait BeaconClient: Send + Sync {
    /// Fetch chain spec parameters from the beacon node.
    fn fetch_spec(&self) -> impl std::future::Future<Output = Result<SpecResponse>> + Send;

    /// Fetch the current head and finality checkpoints.
    fn fetch_head(&self) -> impl std::future::Future<Output = Result<BeaconHead>> + Send;

    /// Fetch validator balances (gwei) keyed by lowercase pubkey, as of the
    /// head slot. Validators unknown to the beacon node are omitted.
    fn fetch_validator_balances(
        &self,
        pubkeys: &[String],
        head: &BeaconHead,
    ) -> impl std::future::Future<Output = Result<HashMap<String, u64>>> + Send;
}

/// HTTP-based beacon node API client.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    slots_per_epoch: u64,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new beacon node client.
    pub fn new(cfg: &BeaconConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            slots_per_epoch: DEFAULT_SLOTS_PER_EPOCH,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    /// The callback receives (endpoint_name, status, duration).
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    /// Override SLOTS_PER_EPOCH (normally taken from the fetched spec).
    pub fn with_slots_per_epoch(mut self, slots_per_epoch: u64) -> Self {
        if slots_per_epoch > 0 {
            self.slots_per_epoch = slots_per_epoch;
        }
        self
    }

    /// Record a request metric.
    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Perform a GET request and deserialize the JSON response.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let start = Instant::now();
        let endpoint = endpoint_from_path(path);
        let url = format!("{}{}", self.endpoint, path);

        let response = match self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                self.record_request(endpoint, "error", start.elapsed());
                return Err(e).with_context(|| format!("requesting {path}"));
            }
        };

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            bail!("unexpected status {} from {}: {}", status_code, path, body);
        }

        let result: T = response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))?;

        self.record_request(endpoint, "success", start.elapsed());

        Ok(result)
    }
}

/// Extract a short endpoint name from an API path.
fn endpoint_from_path(path: &str) -> &'static str {
    let path = path.split('?').next().unwrap_or(path);
    match path {
        "/eth/v1/config/spec" => "spec",
        HEAD_HEADER_PATH => "header",
        HEAD_FINALITY_PATH => "finality_checkpoints",
        p if p.starts_with("/eth/v1/beacon/states/") && p.ends_with("/validators") => "validators",
        _ => "other",
    }
}

// --- JSON response structures ---

#[derive(Deserialize)]
struct SpecApiResponse {
    data: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct HeaderApiResponse {
    data: HeaderData,
}

#[derive(Deserialize)]
struct HeaderData {
    header: SignedHeader,
}

#[derive(Deserialize)]
struct SignedHeader {
    message: HeaderMessage,
}

#[derive(Deserialize)]
struct HeaderMessage {
    slot: String,
}

#[derive(Deserialize)]
struct FinalityApiResponse {
    data: FinalityData,
}

#[derive(Deserialize)]
struct FinalityData {
    previous_justified: Checkpoint,
    current_justified: Checkpoint,
    finalized: Checkpoint,
}

#[derive(Deserialize)]
struct Checkpoint {
    epoch: String,
}

#[derive(Deserialize)]
struct ValidatorsApiResponse {
    data: Vec<ValidatorEntry>,
}

#[derive(Deserialize)]
struct ValidatorEntry {
    balance: String,
    validator: ValidatorData,
}

#[derive(Deserialize)]
struct ValidatorData {
    pubkey: String,
}

impl BeaconClient for Client {
    async fn fetch_spec(&self) -> Result<SpecResponse> {
        debug!("fetching beacon spec");

        let resp: SpecApiResponse = self
            .get_json("/eth/v1/config/spec")
            .await
            .context("fetching spec")?;

        let seconds_per_slot = spec_uint64(&resp.data, "SECONDS_PER_SLOT")?;
        let slots_per_epoch = spec_uint64(&resp.data, "SLOTS_PER_EPOCH")?;

        Ok(SpecResponse {
            seconds_per_slot,
            slots_per_epoch,
        })
    }

    async fn fetch_head(&self) -> Result<BeaconHead> {
        debug!("fetching beacon head");

        let (header, finality) = tokio::try_join!(
            self.get_json::<HeaderApiResponse>(HEAD_HEADER_PATH),
            self.get_json::<FinalityApiResponse>(HEAD_FINALITY_PATH),
        )
        .context("fetching beacon head")?;

        let slot = parse_u64("slot", &header.data.header.message.slot)?;
        let finalized_epoch = parse_u64("finalized epoch", &finality.data.finalized.epoch)?;
        let justified_epoch = parse_u64("justified epoch", &finality.data.current_justified.epoch)?;
        let previous_justified_epoch = parse_u64(
            "previous justified epoch",
            &finality.data.previous_justified.epoch,
        )?;

        Ok(BeaconHead {
            slot,
            epoch: slot / self.slots_per_epoch,
            finalized_epoch,
            justified_epoch,
            previous_justified_epoch,
        })
    }

    async fn fetch_validator_balances(
        &self,
        pubkeys: &[String],
        head: &BeaconHead,
    ) -> Result<HashMap<String, u64>> {
        let mut balances = HashMap::with_capacity(pubkeys.len());

        for batch in pubkeys.chunks(VALIDATOR_BATCH_SIZE) {
            debug!(
                slot = head.slot,
                count = batch.len(),
                "fetching validator balances"
            );

            let path = format!(
                "/eth/v1/beacon/states/{}/validators?id={}",
                head.slot,
                batch.join(",")
            );

            let resp: ValidatorsApiResponse = self
                .get_json(&path)
                .await
                .context("fetching validator balances")?;

            for entry in resp.data {
                let balance = parse_u64("validator balance", &entry.balance)?;
                balances.insert(entry.validator.pubkey.to_lowercase(), balance);
            }
        }

        Ok(balances)
    }
}

/// Parse a string-encoded u64 from an API response field.
fn parse_u64(field: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>()
        .with_context(|| format!("parsing {field} {raw:?}"))
}

/// Extract a string-encoded u64 from a spec data map.
fn spec_uint64(data: &HashMap<String, serde_json::Value>, key: &str) -> Result<u64> {
    let value = data
        .get(key)
        .with_context(|| format!("spec missing required key {key:?}"))?;

    let s = value
        .as_str()
        .with_context(|| format!("spec key {key:?} is not a string"))?;

    s.parse::<u64>()
        .with_context(|| format!("parsing {key} value {s:?}"))
}
