//! Lookup response negotiation and encoding.
//!
//! Two writer families share one contract: the cascade (IPNI-shaped) writer
//! behind `/multihash` and `/cid`, and the delegated-routing writer behind
//! `/routing/v1/providers`. Each supports a streaming NDJSON shape, where
//! every provider record is one flushed line, and a buffered JSON shape,
//! where records accumulate into a single envelope emitted at the end.
//!
//! | Writer | Streaming line | Buffered envelope | Empty result |
//! |--------|----------------|-------------------|--------------|
//! | Cascade | singleton `MultihashResults` | accumulated `MultihashResults` | 404 |
//! | Delegated routing | `{Protocol,Schema,ID,Addrs}` | `{"Providers":[...]}` | 200, empty list |

use std::sync::LazyLock;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use cid::Cid;
use libp2p::PeerId;
use multiaddr::Multiaddr;
use multihash::Multihash;
use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::GatewayConfig;
use crate::error::HttpError;
use crate::routing::PeerRecord;

pub const MEDIA_TYPE_NDJSON: &str = "application/x-ndjson";
pub const MEDIA_TYPE_JSON: &str = "application/json";
const MEDIA_TYPE_ANY: &str = "*/*";

/// Context ID carried by every cascade provider result.
pub const CASCADE_CONTEXT_ID: &[u8] = b"ipfs-dht-cascade";

/// Registered multicodec for the bitswap transport.
const TRANSPORT_BITSWAP_CODE: u64 = 0x0900;

const DR_PROTOCOL_BITSWAP: &str = "transport-bitswap";
const DR_SCHEMA_BITSWAP: &str = "bitswap";

const CIDV1_RAW_CODEC: u64 = 0x55;

/// Varint-encoded bitswap transport code, the fixed cascade metadata.
static CASCADE_METADATA: LazyLock<Vec<u8>> = LazyLock::new(|| {
    let mut buf = unsigned_varint::encode::u64_buffer();
    unsigned_varint::encode::u64(TRANSPORT_BITSWAP_CODE, &mut buf).to_vec()
});

// ============================================================================
// Lookup key
// ============================================================================

/// The content identifier a lookup routes on. Both accepted URL forms reduce
/// to a multihash plus its canonical CIDv1 raw form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupKey {
    cid: Cid,
}

impl LookupKey {
    /// Parses a base58-encoded multihash path segment.
    pub fn from_b58_multihash(segment: &str) -> Result<Self, HttpError> {
        let bytes = bs58::decode(segment)
            .into_vec()
            .map_err(|e| HttpError::bad_request(e.to_string()))?;
        let multihash = Multihash::from_bytes(&bytes)
            .map_err(|e| HttpError::bad_request(e.to_string()))?;
        Ok(Self {
            cid: Cid::new_v1(CIDV1_RAW_CODEC, multihash),
        })
    }

    /// Parses a self-describing CID path segment.
    pub fn from_cid_str(segment: &str) -> Result<Self, HttpError> {
        let cid = Cid::try_from(segment).map_err(|e| HttpError::bad_request(e.to_string()))?;
        Ok(Self { cid })
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    pub fn multihash(&self) -> &Multihash<64> {
        self.cid.hash()
    }

    pub fn multihash_b58(&self) -> String {
        bs58::encode(self.cid.hash().to_bytes()).into_string()
    }
}

// ============================================================================
// Response negotiation
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// NDJSON, one flushed line per provider record.
    Streaming,
    /// A single JSON envelope written at the end of the lookup.
    Buffered,
}

/// Picks the response shape from the request's `Accept` header.
///
/// `can_stream` reflects whether the response sink can flush mid-stream; a
/// streaming request downgrades to buffered when it cannot, and fails when
/// buffered is not acceptable either.
pub fn negotiate(
    headers: &HeaderMap,
    prefer_json: bool,
    can_stream: bool,
) -> Result<ResponseMode, HttpError> {
    let mut ndjson = false;
    let mut json = false;
    for value in headers.get_all(header::ACCEPT) {
        let Ok(value) = value.to_str() else {
            return Err(HttpError::bad_request("invalid Accept header"));
        };
        for part in value.split(',') {
            let media_type: mime::Mime = part.trim().parse().map_err(|e| {
                debug!(err = %e, "failed to check accepted response media type");
                HttpError::bad_request("invalid Accept header")
            })?;
            match media_type.essence_str() {
                MEDIA_TYPE_NDJSON => ndjson = true,
                MEDIA_TYPE_JSON => json = true,
                MEDIA_TYPE_ANY => {
                    json = true;
                    if !prefer_json {
                        ndjson = true;
                    }
                }
                _ => {}
            }
        }
    }

    if ndjson && !can_stream {
        if json {
            return Ok(ResponseMode::Buffered);
        }
        return Err(HttpError::bad_request(
            "server does not support streaming response",
        ));
    }
    if ndjson {
        Ok(ResponseMode::Streaming)
    } else if json {
        Ok(ResponseMode::Buffered)
    } else {
        Err(HttpError::bad_request("media type not supported"))
    }
}

/// Headers for the negotiated mode. Set on the response before any body byte.
fn response_headers(mode: ResponseMode, allow_origin: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    match mode {
        ResponseMode::Streaming => {
            let _ = headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(MEDIA_TYPE_NDJSON));
            let _ = headers.insert(header::CONNECTION, HeaderValue::from_static("Keep-Alive"));
            let _ = headers.insert(
                header::X_CONTENT_TYPE_OPTIONS,
                HeaderValue::from_static("nosniff"),
            );
        }
        ResponseMode::Buffered => {
            let _ = headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(MEDIA_TYPE_JSON));
        }
    }
    if let Ok(origin) = HeaderValue::from_str(allow_origin) {
        let _ = headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, origin);
    }
    headers
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Serialize)]
struct CascadeResults {
    #[serde(rename = "MultihashResults")]
    multihash_results: Vec<CascadeMultihashResult>,
}

#[derive(Serialize)]
struct CascadeMultihashResult {
    #[serde(rename = "Multihash", serialize_with = "ser_multihash_b58")]
    multihash: Multihash<64>,
    #[serde(rename = "ProviderResults")]
    provider_results: Vec<CascadeProviderResult>,
}

#[derive(Clone, Serialize)]
struct CascadeProviderResult {
    #[serde(rename = "ContextID", serialize_with = "ser_bytes_b64")]
    context_id: Vec<u8>,
    #[serde(rename = "Metadata", serialize_with = "ser_bytes_b64")]
    metadata: Vec<u8>,
    #[serde(rename = "Provider")]
    provider: ProviderAddrInfo,
}

#[derive(Clone, Serialize)]
struct ProviderAddrInfo {
    #[serde(rename = "ID", serialize_with = "ser_peer_id")]
    id: PeerId,
    #[serde(rename = "Addrs", serialize_with = "ser_addrs")]
    addrs: Vec<Multiaddr>,
}

#[derive(Serialize)]
struct DelegatedProviderRecords {
    #[serde(rename = "Providers")]
    providers: Vec<DelegatedProviderRecord>,
}

#[derive(Clone, Serialize)]
struct DelegatedProviderRecord {
    #[serde(rename = "Protocol")]
    protocol: &'static str,
    #[serde(rename = "Schema")]
    schema: &'static str,
    #[serde(rename = "ID", serialize_with = "ser_peer_id")]
    id: PeerId,
    #[serde(rename = "Addrs", serialize_with = "ser_addrs")]
    addrs: Vec<Multiaddr>,
}

fn ser_multihash_b58<S: Serializer>(mh: &Multihash<64>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&bs58::encode(mh.to_bytes()).into_string())
}

fn ser_bytes_b64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&BASE64.encode(bytes))
}

fn ser_peer_id<S: Serializer>(id: &PeerId, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&id.to_base58())
}

fn ser_addrs<S: Serializer>(addrs: &[Multiaddr], serializer: S) -> Result<S::Ok, S::Error> {
    let mut seq = serializer.serialize_seq(Some(addrs.len()))?;
    for addr in addrs {
        seq.serialize_element(&addr.to_string())?;
    }
    seq.end()
}

fn encode_ndjson_line<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    Ok(Bytes::from(line))
}

fn json_response<T: Serialize>(headers: &HeaderMap, envelope: &T) -> Result<Response, HttpError> {
    let mut body = serde_json::to_vec(envelope).map_err(|e| {
        debug!(err = %e, "failed to encode json response");
        HttpError::new(StatusCode::INTERNAL_SERVER_ERROR, "")
    })?;
    body.push(b'\n');
    let mut response = Response::new(Body::from(body));
    *response.headers_mut() = headers.clone();
    Ok(response)
}

fn empty_response(headers: &HeaderMap) -> Response {
    let mut response = Response::new(Body::empty());
    *response.headers_mut() = headers.clone();
    response
}

// ============================================================================
// Writers
// ============================================================================

/// One lookup response in the making. `write_record` is called once per
/// provider record in engine production order; `finish` runs exactly once on
/// the handler path, also after cancellation.
#[async_trait]
pub trait LookupResponseWriter: Send + 'static {
    fn key(&self) -> &LookupKey;

    fn mode(&self) -> ResponseMode;

    /// Headers negotiated for this response.
    fn headers(&self) -> &HeaderMap;

    /// Encodes one provider record. In streaming mode this emits and flushes
    /// a frame; failure means the sink is gone and the lookup should stop.
    async fn write_record(&mut self, record: PeerRecord) -> Result<()>;

    /// Completes the response. Returns the buffered payload when this writer
    /// owns response production, `None` when the frames already streamed, or
    /// an [`HttpError`] when the outcome maps onto a status (cascade lookups
    /// with zero records signal 404).
    async fn finish(self: Box<Self>) -> Result<Option<Response>, HttpError>;
}

/// A writer plus, in streaming mode, the frame stream feeding the body.
pub struct WriterParts {
    pub writer: Box<dyn LookupResponseWriter>,
    pub frames: Option<mpsc::Receiver<Bytes>>,
}

fn frame_channel(mode: ResponseMode) -> (Option<mpsc::Sender<Bytes>>, Option<mpsc::Receiver<Bytes>>) {
    match mode {
        ResponseMode::Streaming => {
            let (tx, rx) = mpsc::channel(1);
            (Some(tx), Some(rx))
        }
        ResponseMode::Buffered => (None, None),
    }
}

async fn send_frame(frames: &Option<mpsc::Sender<Bytes>>, frame: Bytes) -> Result<()> {
    match frames {
        Some(frames) => frames
            .send(frame)
            .await
            .map_err(|_| anyhow!("response sink closed")),
        None => Err(anyhow!("writer has no frame stream")),
    }
}

/// IPNI-shaped writer behind the `/multihash` and `/cid` endpoints.
pub struct CascadeLookupWriter {
    key: LookupKey,
    mode: ResponseMode,
    headers: HeaderMap,
    frames: Option<mpsc::Sender<Bytes>>,
    results: Vec<CascadeProviderResult>,
    count: usize,
}

impl CascadeLookupWriter {
    pub fn accept_multihash(
        segment: &str,
        headers: &HeaderMap,
        config: &GatewayConfig,
        can_stream: bool,
    ) -> Result<WriterParts, HttpError> {
        Self::accept(LookupKey::from_b58_multihash(segment)?, headers, config, can_stream)
    }

    pub fn accept_cid(
        segment: &str,
        headers: &HeaderMap,
        config: &GatewayConfig,
        can_stream: bool,
    ) -> Result<WriterParts, HttpError> {
        Self::accept(LookupKey::from_cid_str(segment)?, headers, config, can_stream)
    }

    fn accept(
        key: LookupKey,
        headers: &HeaderMap,
        config: &GatewayConfig,
        can_stream: bool,
    ) -> Result<WriterParts, HttpError> {
        let mode = negotiate(headers, config.http_response_prefer_json, can_stream)?;
        let (frames_tx, frames_rx) = frame_channel(mode);
        let writer = Self {
            key,
            mode,
            headers: response_headers(mode, &config.http_allow_origin),
            frames: frames_tx,
            results: Vec::new(),
            count: 0,
        };
        Ok(WriterParts {
            writer: Box::new(writer),
            frames: frames_rx,
        })
    }

    fn provider_result(record: PeerRecord) -> CascadeProviderResult {
        CascadeProviderResult {
            context_id: CASCADE_CONTEXT_ID.to_vec(),
            metadata: CASCADE_METADATA.clone(),
            provider: ProviderAddrInfo {
                id: record.peer_id,
                addrs: record.addrs,
            },
        }
    }

    fn envelope(&self, provider_results: Vec<CascadeProviderResult>) -> CascadeResults {
        CascadeResults {
            multihash_results: vec![CascadeMultihashResult {
                multihash: *self.key.multihash(),
                provider_results,
            }],
        }
    }
}

#[async_trait]
impl LookupResponseWriter for CascadeLookupWriter {
    fn key(&self) -> &LookupKey {
        &self.key
    }

    fn mode(&self) -> ResponseMode {
        self.mode
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    async fn write_record(&mut self, record: PeerRecord) -> Result<()> {
        let result = Self::provider_result(record);
        match self.mode {
            ResponseMode::Streaming => {
                let line = encode_ndjson_line(&self.envelope(vec![result]))?;
                send_frame(&self.frames, line).await?;
            }
            ResponseMode::Buffered => self.results.push(result),
        }
        self.count += 1;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Option<Response>, HttpError> {
        if self.count == 0 {
            return Err(HttpError::not_found());
        }
        debug!(count = self.count, "finished writing cascade lookup results");
        match self.mode {
            ResponseMode::Streaming => Ok(None),
            ResponseMode::Buffered => {
                let envelope = self.envelope(self.results.clone());
                Ok(Some(json_response(&self.headers, &envelope)?))
            }
        }
    }
}

/// Delegated-routing writer behind `/routing/v1/providers`.
pub struct DelegatedRoutingLookupWriter {
    key: LookupKey,
    mode: ResponseMode,
    headers: HeaderMap,
    frames: Option<mpsc::Sender<Bytes>>,
    providers: Vec<DelegatedProviderRecord>,
    count: usize,
}

impl DelegatedRoutingLookupWriter {
    pub fn accept_cid(
        segment: &str,
        headers: &HeaderMap,
        config: &GatewayConfig,
        can_stream: bool,
    ) -> Result<WriterParts, HttpError> {
        let key = LookupKey::from_cid_str(segment)?;
        let mode = negotiate(headers, config.http_response_prefer_json, can_stream)?;
        let (frames_tx, frames_rx) = frame_channel(mode);
        let writer = Self {
            key,
            mode,
            headers: response_headers(mode, &config.http_allow_origin),
            frames: frames_tx,
            providers: Vec::new(),
            count: 0,
        };
        Ok(WriterParts {
            writer: Box::new(writer),
            frames: frames_rx,
        })
    }

    fn provider_record(record: PeerRecord) -> DelegatedProviderRecord {
        DelegatedProviderRecord {
            protocol: DR_PROTOCOL_BITSWAP,
            schema: DR_SCHEMA_BITSWAP,
            id: record.peer_id,
            addrs: record.addrs,
        }
    }
}

#[async_trait]
impl LookupResponseWriter for DelegatedRoutingLookupWriter {
    fn key(&self) -> &LookupKey {
        &self.key
    }

    fn mode(&self) -> ResponseMode {
        self.mode
    }

    fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    async fn write_record(&mut self, record: PeerRecord) -> Result<()> {
        let record = Self::provider_record(record);
        match self.mode {
            ResponseMode::Streaming => {
                let line = encode_ndjson_line(&record)?;
                send_frame(&self.frames, line).await?;
            }
            ResponseMode::Buffered => self.providers.push(record),
        }
        self.count += 1;
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<Option<Response>, HttpError> {
        debug!(count = self.count, "finished writing delegated routing results");
        match self.mode {
            // An empty result set is a valid, empty stream.
            ResponseMode::Streaming if self.count == 0 => Ok(Some(empty_response(&self.headers))),
            ResponseMode::Streaming => Ok(None),
            ResponseMode::Buffered => {
                let envelope = DelegatedProviderRecords {
                    providers: self.providers.clone(),
                };
                Ok(Some(json_response(&self.headers, &envelope)?))
            }
        }
    }
}
