//! Scripted transport, recording observer and fixtures shared by the loader tests.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::io::Cursor;
use std::rc::Rc;
use std::time::Duration;

use image::codecs::gif::GifEncoder;
use image::{Delay, DynamicImage, Frame, ImageBuffer, ImageFormat, Rgba, RgbaImage};
use imgcache_core::clock::ManualClock;
use imgcache_core::config::{DecodePoolConfig, ImageCacheConfig};
use imgcache_core::error::LoadError;
use imgcache_core::loader::{
    AllowAll, AppContext, ChannelRequest, ImageLoader, ImageObserver, LoaderEnv, Notification,
    ResponseInfo, Transport,
};
use imgcache_core::types::{ChannelId, ProxyId};

/// Transport that records what the loader asks for; the test plays the network.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    next: Cell<u64>,
    pub opened: RefCell<Vec<(ChannelId, ChannelRequest)>>,
    pub cancelled: RefCell<Vec<ChannelId>>,
    pub refuse: Cell<bool>,
}

impl ScriptedTransport {
    pub fn last_channel(&self) -> ChannelId {
        self.opened.borrow().last().map(|(id, _)| *id).expect("no channel opened")
    }

    pub fn opened_count(&self) -> usize {
        self.opened.borrow().len()
    }

    pub fn was_cancelled(&self, channel: ChannelId) -> bool {
        self.cancelled.borrow().contains(&channel)
    }
}

impl Transport for ScriptedTransport {
    fn open(&self, request: &ChannelRequest) -> Result<ChannelId, LoadError> {
        if self.refuse.get() {
            return Err(LoadError::Transport { uri: request.uri.clone(), reason: "refused".into() });
        }
        self.next.set(self.next.get() + 1);
        let id = ChannelId::new(self.next.get());
        self.opened.borrow_mut().push((id, request.clone()));
        Ok(id)
    }

    fn cancel(&self, channel: ChannelId) {
        self.cancelled.borrow_mut().push(channel);
    }
}

#[derive(Debug, Default)]
pub struct Recorder {
    seen: RefCell<Vec<Notification>>,
}

impl Recorder {
    pub fn seen(&self) -> Vec<Notification> {
        self.seen.borrow().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Notification) -> bool) -> usize {
        self.seen.borrow().iter().filter(|n| predicate(n)).count()
    }

    pub fn clear(&self) {
        self.seen.borrow_mut().clear();
    }
}

impl ImageObserver for Recorder {
    fn notify(&self, _: ProxyId, notification: &Notification) {
        self.seen.borrow_mut().push(notification.clone());
    }
}

pub fn observer() -> (Rc<Recorder>, Rc<dyn ImageObserver>) {
    let recorder = Rc::new(Recorder::default());
    let observer: Rc<dyn ImageObserver> = recorder.clone();
    (recorder, observer)
}

pub struct Harness {
    pub context: AppContext,
    pub transport: Rc<ScriptedTransport>,
    pub clock: Rc<ManualClock>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ImageCacheConfig {
            decode: DecodePoolConfig { worker_threads: 1, sync_decode_pixel_limit: 1 << 20 },
            ..Default::default()
        })
    }

    pub fn with_config(config: ImageCacheConfig) -> Self {
        let transport = Rc::new(ScriptedTransport::default());
        let clock = Rc::new(ManualClock::new(1_000));
        let env = LoaderEnv {
            transport: transport.clone(),
            security: Rc::new(AllowAll),
            clock: clock.clone(),
        };
        let context = AppContext::new(config, env).expect("context");
        Self { context, transport, clock }
    }

    pub fn loader(&mut self) -> &mut ImageLoader {
        self.context.loader()
    }

    /// Play a complete successful response on `channel`.
    pub fn respond(&mut self, channel: ChannelId, response: ResponseInfo, body: &[u8]) {
        let loader = self.context.loader();
        loader.on_start_request(channel, response);
        loader.on_data_available(channel, body);
        loader.on_stop_request(channel, Ok(()));
    }

    /// Apply decode completions until the pool goes quiet.
    pub fn settle(&mut self) {
        while self.context.loader().wait_for_decodes(Duration::from_millis(500)) > 0 {}
    }
}

pub fn png(width: u32, height: u32) -> Vec<u8> {
    let image = ImageBuffer::from_pixel(width, height, Rgba([120u8, 80, 40, 255]));
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(image).write_to(&mut cursor, ImageFormat::Png).expect("encode png");
    cursor.into_inner()
}

pub fn gif(frames: usize, delay_ms: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    {
        let mut encoder = GifEncoder::new(&mut bytes);
        for index in 0..frames {
            let shade = (index * 50) as u8;
            let buffer = RgbaImage::from_pixel(5, 5, Rgba([shade, 255 - shade, 0, 255]));
            let frame = Frame::from_parts(buffer, 0, 0, Delay::from_numer_denom_ms(delay_ms, 1));
            encoder.encode_frame(frame).expect("encode frame");
        }
    }
    bytes
}
