//! The per-URL download state machine and its message handlers.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use tracing::{debug, error, info, warn};

use super::error::MediaError;
use super::metadata::MediaMetadata;
use super::part::{chunk_part, Part, PartRef, PartStatus};
use super::sink::PlaybackSink;
use crate::bus::MessageBus;
use crate::config::MediaConfig;
use crate::gossip::Descriptor;
use crate::message::{Message, MessageType, PeerId};
use crate::origin::OriginFetch;
use crate::peer::PeerHandle;

/// Where one part will be requested from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartSource {
    Remote(PeerId),
    /// The source of last resort.
    Origin,
}

/// Download state for one media URL.
pub struct Media {
    pub url: String,
    pub meta_url: String,
    pub metadata: Option<MediaMetadata>,
    pub parts: Vec<Part>,
    /// Which remote peer holds which parts, rebuilt from every gossip
    /// view update.
    pub remotes: HashMap<PeerId, Vec<u32>>,
    pub complete: bool,
    next_append: usize,
    sink: Arc<dyn PlaybackSink>,
}

impl Media {
    pub fn new(
        url: impl Into<String>,
        meta_url: impl Into<String>,
        sink: Arc<dyn PlaybackSink>,
    ) -> Self {
        Self {
            url: url.into(),
            meta_url: meta_url.into(),
            metadata: None,
            parts: Vec::new(),
            remotes: HashMap::new(),
            complete: false,
            next_append: 0,
            sink,
        }
    }

    /// Creates one `Needed` slot per cluster.
    pub fn init_parts(&mut self, count: usize) {
        self.parts = (0..count as u32).map(Part::new).collect();
        self.next_append = 0;
        self.complete = false;
    }

    /// Whether this peer has appended the part to its own sink. Accepts
    /// any integer so out-of-range probes are simply `false`.
    pub fn has_part(&self, number: i64) -> bool {
        if number < 0 {
            return false;
        }
        self.parts
            .get(number as usize)
            .is_some_and(|part| part.status == PartStatus::Added)
    }

    /// Whether a remote peer advertises the part.
    pub fn remote_has_part(&self, remote: &PeerId, number: i64) -> bool {
        if number < 0 {
            return false;
        }
        self.remotes
            .get(remote)
            .is_some_and(|parts| parts.contains(&(number as u32)))
    }

    /// Part numbers this peer can advertise.
    pub fn parts_held(&self) -> Vec<u32> {
        self.parts
            .iter()
            .filter(|part| part.status == PartStatus::Added)
            .map(|part| part.number)
            .collect()
    }

    /// Picks the next `count` parts to download, in part order, marking
    /// each `Pending`. Every selected part gets a uniformly random holder
    /// from the remote table, or the origin when nobody advertises it.
    pub fn next_parts_to_download(&mut self, count: usize) -> Vec<(PartSource, u32)> {
        let needed: Vec<u32> = self
            .parts
            .iter()
            .filter(|part| part.status == PartStatus::Needed)
            .map(|part| part.number)
            .take(count)
            .collect();

        let mut rng = rand::rng();
        let mut selections = Vec::with_capacity(needed.len());
        for number in needed {
            let holders: Vec<&PeerId> = self
                .remotes
                .iter()
                .filter(|(_, parts)| parts.contains(&number))
                .map(|(id, _)| id)
                .collect();
            let source = match holders.choose(&mut rng) {
                Some(holder) => PartSource::Remote((*holder).clone()),
                None => PartSource::Origin,
            };
            if let Some(part) = self.parts.get_mut(number as usize) {
                part.status = PartStatus::Pending;
            }
            selections.push((source, number));
        }
        selections
    }

    fn sink_initialize(&self, head: Bytes) {
        self.sink.initialize(head);
    }

    /// Appends every in-order `Available` part to the sink; signals
    /// end-of-stream once all parts are `Added`.
    fn append_ready_parts(&mut self) {
        while let Some(part) = self.parts.get_mut(self.next_append) {
            if part.status != PartStatus::Available {
                break;
            }
            if let Some(data) = part.data.clone() {
                self.sink.append(data);
            }
            part.status = PartStatus::Added;
            self.next_append += 1;
        }
        if !self.parts.is_empty() && self.next_append == self.parts.len() && !self.complete {
            self.complete = true;
            self.sink.finish();
            info!(url = %self.url, "media complete");
        }
    }
}

/// Drives every tracked media through metadata, head and part
/// acquisition, serves part requests from remotes, and projects gossip
/// view updates into per-media remote-availability tables.
pub struct MediaFetcher {
    config: MediaConfig,
    handle: PeerHandle,
    origin: Arc<dyn OriginFetch>,
    media: RwLock<HashMap<String, Media>>,
}

impl MediaFetcher {
    pub fn new(
        config: MediaConfig,
        handle: PeerHandle,
        origin: Arc<dyn OriginFetch>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handle,
            origin,
            media: RwLock::new(HashMap::new()),
        })
    }

    /// Subscribes the fetcher's handlers on the bus.
    pub fn register(self: &Arc<Self>, bus: &MessageBus) {
        let fetcher = Arc::clone(self);
        bus.on(MessageType::MediaRequestMetadata, move |message| {
            fetcher.on_request_metadata(message);
        });
        let fetcher = Arc::clone(self);
        bus.on(MessageType::MediaMetadata, move |message| {
            fetcher.on_metadata(message);
        });
        let fetcher = Arc::clone(self);
        bus.on(MessageType::MediaRequestHead, move |message| {
            fetcher.on_request_head(message);
        });
        let fetcher = Arc::clone(self);
        bus.on(MessageType::MediaHead, move |message| {
            Arc::clone(&fetcher).on_head(message);
        });
        let fetcher = Arc::clone(self);
        bus.on(MessageType::MediaRequestPart, move |message| {
            fetcher.on_request_part(message);
        });
        let fetcher = Arc::clone(self);
        bus.on(MessageType::MediaPart, move |message| {
            Arc::clone(&fetcher).on_part(message);
        });
        let fetcher = Arc::clone(self);
        bus.on(MessageType::GossipViewUpdate, move |message| {
            fetcher.on_view_update(message);
        });
    }

    /// Starts tracking a media URL. With `autoload` set (the default) the
    /// metadata request goes out immediately; otherwise call
    /// [`MediaFetcher::load`].
    pub fn add(
        &self,
        url: impl Into<String>,
        meta_url: impl Into<String>,
        sink: Arc<dyn PlaybackSink>,
    ) {
        let url = url.into();
        let media = Media::new(url.clone(), meta_url, sink);
        self.media.write().insert(url.clone(), media);
        if self.config.autoload {
            self.load(&url);
        }
    }

    /// Kicks off the metadata request for a tracked URL.
    pub fn load(&self, url: &str) {
        let mut request = self.local_message(MessageType::MediaRequestMetadata);
        request.url = Some(url.to_string());
        self.handle.dispatch_local(request);
    }

    pub fn media_urls(&self) -> Vec<String> {
        self.media.read().keys().cloned().collect()
    }

    pub fn is_complete(&self, url: &str) -> bool {
        self.media
            .read()
            .get(url)
            .is_some_and(|media| media.complete)
    }

    /// Read access to one media's state.
    pub fn with_media<R>(&self, url: &str, read: impl FnOnce(&Media) -> R) -> Option<R> {
        self.media.read().get(url).map(read)
    }

    /// Mutable access to one media's state.
    pub fn with_media_mut<R>(&self, url: &str, edit: impl FnOnce(&mut Media) -> R) -> Option<R> {
        self.media.write().get_mut(url).map(edit)
    }

    fn local_message(&self, kind: MessageType) -> Message {
        Message::new(kind, self.handle.id().clone(), self.handle.id().clone())
    }

    fn on_request_metadata(&self, message: &Message) {
        let Some(url) = message.url.clone() else {
            warn!("metadata request without a url");
            return;
        };
        let meta_url = match self.media.read().get(&url) {
            Some(media) => media.meta_url.clone(),
            None => {
                warn!("{}", MediaError::UnknownMedia(url));
                return;
            }
        };

        let origin = Arc::clone(&self.origin);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            match origin.fetch_json(&meta_url).await {
                Ok(value) => {
                    let mut reply = Message::new(
                        MessageType::MediaMetadata,
                        handle.id().clone(),
                        handle.id().clone(),
                    );
                    reply.url = Some(url);
                    reply.data = Some(value);
                    handle.dispatch_local(reply);
                }
                Err(fetch_error) => {
                    error!(%meta_url, error = %fetch_error, "metadata fetch failed");
                }
            }
        });
    }

    fn on_metadata(&self, message: &Message) {
        let Some(url) = message.url.clone() else {
            warn!("metadata without a url");
            return;
        };
        let metadata: MediaMetadata = match message.typed_data() {
            Ok(metadata) => metadata,
            Err(parse_error) => {
                warn!(%url, error = %parse_error, "unusable metadata");
                return;
            }
        };
        if let Err(invalid) = metadata.validate() {
            warn!(%url, error = %invalid, "rejecting metadata");
            return;
        }

        {
            let mut media_map = self.media.write();
            let Some(media) = media_map.get_mut(&url) else {
                warn!("{}", MediaError::UnknownMedia(url));
                return;
            };
            media.init_parts(metadata.part_count());
            media.metadata = Some(metadata);
            debug!(url = %media.url, parts = media.parts.len(), "metadata installed");
        }

        let mut request = self.local_message(MessageType::MediaRequestHead);
        request.url = Some(url);
        self.handle.dispatch_local(request);
    }

    fn on_request_head(&self, message: &Message) {
        let Some(url) = message.url.clone() else {
            warn!("head request without a url");
            return;
        };
        let range = match self.media.read().get(&url) {
            Some(media) => media.metadata.as_ref().and_then(MediaMetadata::head_range),
            None => {
                warn!("{}", MediaError::UnknownMedia(url));
                return;
            }
        };
        let Some((start, end)) = range else {
            // Nothing before the first cluster; synthesize an empty head
            // so the pipeline still initializes the sink.
            let mut reply = self.local_message(MessageType::MediaHead);
            reply.url = Some(url);
            reply.data = serde_json::to_value(Vec::<u8>::new()).ok();
            self.handle.dispatch_local(reply);
            return;
        };

        let origin = Arc::clone(&self.origin);
        let handle = self.handle.clone();
        tokio::spawn(async move {
            match origin.fetch_range(&url, start, end).await {
                Ok(head) => {
                    let mut reply = Message::new(
                        MessageType::MediaHead,
                        handle.id().clone(),
                        handle.id().clone(),
                    );
                    reply.url = Some(url);
                    reply.data = serde_json::to_value(head.to_vec()).ok();
                    handle.dispatch_local(reply);
                }
                Err(fetch_error) => {
                    error!(%url, error = %fetch_error, "head fetch failed");
                }
            }
        });
    }

    fn on_head(self: Arc<Self>, message: &Message) {
        let Some(url) = message.url.clone() else {
            warn!("head without a url");
            return;
        };
        let head: Vec<u8> = match message.typed_data() {
            Ok(head) => head,
            Err(parse_error) => {
                warn!(%url, error = %parse_error, "unusable head buffer");
                return;
            }
        };

        match self.media.read().get(&url) {
            Some(media) => media.sink_initialize(Bytes::from(head)),
            None => {
                warn!("{}", MediaError::UnknownMedia(url));
                return;
            }
        }
        let count = self.config.concurrent_parts;
        self.ask_for_next_parts(&url, count);
    }

    /// Serves a part to a requesting remote as a run of `"P:C:N"` chunks.
    fn on_request_part(&self, message: &Message) {
        let requester = message.from.clone();
        let Some(url) = message.url.clone() else {
            warn!(%requester, "part request without a url");
            return;
        };
        let number = match message.number.as_deref().map(str::parse::<PartRef>) {
            Some(Ok(reference)) => reference.part,
            Some(Err(parse_error)) => {
                warn!(%requester, error = %parse_error, "part request rejected");
                return;
            }
            None => {
                warn!(%requester, "part request without a number");
                return;
            }
        };

        let data = match self.media.read().get(&url) {
            Some(media) => media
                .parts
                .get(number as usize)
                .and_then(|part| part.data.clone()),
            None => None,
        };
        let Some(data) = data else {
            debug!(%requester, %url, number, "requested part not held");
            return;
        };

        let chunks = chunk_part(&data, self.config.chunk_size);
        let total = chunks.len() as u32;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut reply = Message::new(
                MessageType::MediaPart,
                self.handle.id().clone(),
                requester.clone(),
            );
            reply.url = Some(url.clone());
            reply.number = Some(PartRef::chunked(number, index as u32, total).to_string());
            reply.data = serde_json::to_value(chunk.to_vec()).ok();
            self.handle.send(reply);
        }
    }

    /// Part ingestion: chunks accumulate until the part is whole, then it
    /// joins the append loop and the node advertises it.
    fn on_part(self: Arc<Self>, message: &Message) {
        let Some(url) = message.url.clone() else {
            warn!("part without a url");
            return;
        };
        let reference: PartRef = match message.number.as_deref().map(str::parse) {
            Some(Ok(reference)) => reference,
            Some(Err(parse_error)) => {
                warn!(%url, error = %parse_error, "part rejected");
                return;
            }
            None => {
                warn!(%url, "part without a number");
                return;
            }
        };
        let data: Vec<u8> = match message.typed_data() {
            Ok(data) => data,
            Err(parse_error) => {
                warn!(%url, number = %reference, error = %parse_error, "unusable part buffer");
                return;
            }
        };

        let became_available = {
            let mut media_map = self.media.write();
            let Some(media) = media_map.get_mut(&url) else {
                warn!("{}", MediaError::UnknownMedia(url));
                return;
            };
            let Some(part) = media.parts.get_mut(reference.part as usize) else {
                warn!(%url, "{}", MediaError::PartOutOfRange(reference.part));
                return;
            };
            if part.status != PartStatus::Pending {
                // Covers late peer responses after an origin fallback.
                warn!(
                    "{}",
                    MediaError::UnexpectedPart {
                        url: url.clone(),
                        part: reference.part,
                    }
                );
                return;
            }

            let available = match reference.chunk {
                Some((index, total)) => part.accept_chunk(index, total, Bytes::from(data)),
                None => {
                    part.accept_whole(Bytes::from(data));
                    true
                }
            };
            if available {
                media.append_ready_parts();
            }
            available
        };

        if became_available {
            self.publish_parts_held(&url);
            self.ask_for_next_parts(&url, 1);
        }
    }

    /// Projects a gossip view into every media's remote table.
    fn on_view_update(&self, message: &Message) {
        let descriptors: Vec<Descriptor> = match message.typed_data() {
            Ok(descriptors) => descriptors,
            Err(parse_error) => {
                warn!(error = %parse_error, "view update without descriptors");
                return;
            }
        };

        let mut media_map = self.media.write();
        for media in media_map.values_mut() {
            let mut remotes = HashMap::new();
            for descriptor in &descriptors {
                let Some(value) = descriptor.get_path(&["media", media.url.as_str()]) else {
                    continue;
                };
                match serde_json::from_value::<Vec<u32>>(value.clone()) {
                    Ok(parts) => {
                        remotes.insert(descriptor.id.clone(), parts);
                    }
                    Err(parse_error) => {
                        debug!(remote = %descriptor.id, error = %parse_error, "bad availability entry");
                    }
                }
            }
            media.remotes = remotes;
        }
    }

    /// Selects and requests up to `count` further parts.
    pub fn ask_for_next_parts(self: Arc<Self>, url: &str, count: usize) {
        let selections = match self.media.write().get_mut(url) {
            Some(media) => media.next_parts_to_download(count),
            None => return,
        };

        for (source, number) in selections {
            match source {
                PartSource::Remote(remote) => {
                    Arc::clone(&self).request_part_from(url.to_string(), number, remote);
                }
                PartSource::Origin => {
                    let fetcher = Arc::clone(&self);
                    let url = url.to_string();
                    tokio::spawn(async move {
                        fetcher.origin_fetch_part(url, number).await;
                    });
                }
            }
        }
    }

    /// Requests one part from a peer; at the deadline, a part still
    /// `Pending` falls back to the origin. A peer response arriving after
    /// that is rejected by ingestion.
    fn request_part_from(self: Arc<Self>, url: String, number: u32, remote: PeerId) {
        debug!(%remote, %url, number, "requesting part from peer");
        let mut request = Message::new(
            MessageType::MediaRequestPart,
            self.handle.id().clone(),
            remote,
        );
        request.url = Some(url.clone());
        request.number = Some(number.to_string());

        let timeout = self.config.download_timeout();
        let outcome = self.handle.send_with_timeout(request, timeout);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            drop(outcome);

            let still_pending = self
                .media
                .read()
                .get(&url)
                .and_then(|media| media.parts.get(number as usize))
                .is_some_and(|part| part.status == PartStatus::Pending);
            if still_pending {
                debug!(%url, number, "peer request timed out; falling back to origin");
                self.origin_fetch_part(url, number).await;
            }
        });
    }

    /// Fetches one part's byte range from the origin and feeds it back
    /// through the normal ingestion path. On failure the part reverts to
    /// `Needed` so a later pass reschedules it.
    async fn origin_fetch_part(self: Arc<Self>, url: String, number: u32) {
        let range = self
            .media
            .read()
            .get(&url)
            .and_then(|media| media.metadata.as_ref())
            .and_then(|metadata| metadata.part_range(number));
        let Some((start, end)) = range else {
            warn!(%url, "{}", MediaError::PartOutOfRange(number));
            return;
        };

        match self.origin.fetch_range(&url, start, end).await {
            Ok(data) => {
                let mut reply = self.local_message(MessageType::MediaPart);
                reply.url = Some(url);
                reply.number = Some(number.to_string());
                reply.data = serde_json::to_value(data.to_vec()).ok();
                self.handle.dispatch_local(reply);
            }
            Err(fetch_error) => {
                error!(%url, number, error = %fetch_error, "origin fetch failed; rescheduling part");
                if let Some(media) = self.media.write().get_mut(&url) {
                    if let Some(part) = media.parts.get_mut(number as usize) {
                        if part.status == PartStatus::Pending {
                            part.status = PartStatus::Needed;
                        }
                    }
                }
            }
        }
    }

    /// Publishes this node's held parts into the gossip layer.
    fn publish_parts_held(&self, url: &str) {
        let held = match self.media.read().get(url) {
            Some(media) => media.parts_held(),
            None => return,
        };
        let mut update = self.local_message(MessageType::GossipDescriptorUpdate);
        update.data = Some(serde_json::json!({
            "path": ["media", url],
            "value": held,
        }));
        self.handle.dispatch_local(update);
    }
}
