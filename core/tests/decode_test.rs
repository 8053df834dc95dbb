mod common;

use std::rc::Rc;
use std::time::{Duration, Instant};

use common::{Harness, Recorder, gif, observer, png};
use imgcache_core::config::{DecodePoolConfig, ImageCacheConfig};
use imgcache_core::image::{DecodeFlags, FrameSelection, ImgDrawResult};
use imgcache_core::loader::{LoadRequest, Notification, ResponseInfo};
use imgcache_core::surface::{LookupResult, PlaybackType};
use imgcache_core::types::{ImageId, ProxyId, Size};

fn loaded(harness: &mut Harness, uri: &str, content_type: &str, body: &[u8]) -> (ProxyId, Rc<Recorder>) {
    let (seen, obs) = observer();
    let proxy = harness.loader().load_image(LoadRequest::new(uri), obs).unwrap();
    harness.respond(harness.transport.last_channel(), ResponseInfo::ok(content_type), body);
    (proxy, seen)
}

fn image_id(harness: &mut Harness, proxy: ProxyId) -> ImageId {
    harness.loader().request_of(proxy).map(|r| r.image().id()).expect("request")
}

#[test]
fn sync_lookup_decodes_inline_then_hits() {
    let mut harness = Harness::new();
    let (proxy, _) = loaded(&mut harness, "https://img.test/a.png", "image/png", &png(16, 12));
    let size = Size::new(16, 12);

    let first = harness.loader().lookup_frame(proxy, size, DecodeFlags::SYNC_DECODE, PlaybackType::Static).unwrap();
    assert!(first.is_found());
    assert_eq!(harness.context.pool().executed_count(), 1);

    let second = harness.loader().lookup_frame(proxy, size, DecodeFlags::SYNC_DECODE, PlaybackType::Static).unwrap();
    assert!(matches!(second, LookupResult::Found(_)));
    assert_eq!(harness.context.pool().executed_count(), 1);
}

#[test]
fn identical_lookups_share_one_decode() {
    let mut harness = Harness::new();
    let (proxy, seen) = loaded(&mut harness, "https://img.test/b.png", "image/png", &png(32, 32));
    let size = Size::new(32, 32);

    for _ in 0..2 {
        harness.loader().lookup_frame(proxy, size, DecodeFlags::ASYNC_NOTIFY, PlaybackType::Static).unwrap();
    }
    harness.settle();

    assert_eq!(harness.context.pool().executed_count(), 1);
    assert_eq!(seen.count(|n| *n == Notification::DecodeComplete), 1);
    let hit = harness.loader().lookup_frame(proxy, size, DecodeFlags::empty(), PlaybackType::Static).unwrap();
    assert!(hit.is_found());
}

#[test]
fn lookups_differing_only_in_flags_both_resolve() {
    let mut harness = Harness::new();
    let (proxy, _) = loaded(&mut harness, "https://img.test/e.png", "image/png", &png(64, 64));
    let size = Size::new(64, 64);

    let straight = DecodeFlags::ASYNC_NOTIFY | DecodeFlags::NO_PREMULTIPLY_ALPHA;
    for flags in [DecodeFlags::ASYNC_NOTIFY, straight] {
        harness.loader().lookup_frame(proxy, size, flags, PlaybackType::Static).unwrap();
    }
    harness.settle();

    assert_eq!(harness.context.pool().executed_count(), 2);
    for flags in [DecodeFlags::empty(), DecodeFlags::NO_PREMULTIPLY_ALPHA] {
        let result = harness.loader().lookup_frame(proxy, size, flags, PlaybackType::Static).unwrap();
        assert!(result.is_found());
    }
}

#[test]
fn draw_reports_progress_then_success() {
    let mut harness = Harness::new();
    let (proxy, _) = loaded(&mut harness, "https://img.test/c.png", "image/png", &png(10, 10));
    let size = Size::new(10, 10);

    let pending = harness.loader().draw(proxy, size, DecodeFlags::ASYNC_NOTIFY, FrameSelection::Current).unwrap();
    assert!(matches!(pending.result, ImgDrawResult::Incomplete | ImgDrawResult::NotReady | ImgDrawResult::Success));
    harness.settle();

    let drawn = harness.loader().draw(proxy, size, DecodeFlags::empty(), FrameSelection::Current).unwrap();
    assert_eq!(drawn.result, ImgDrawResult::Success);
    assert!(drawn.surface.is_some());

    let bad = harness.loader().draw(proxy, Size::new(0, 0), DecodeFlags::empty(), FrameSelection::Current).unwrap();
    assert_eq!(bad.result, ImgDrawResult::BadArgs);
}

#[test]
fn corrupt_images_error_once_and_leave_the_cache() {
    let mut harness = Harness::new();
    let mut body = png(8, 8);
    body.truncate(20);
    let (proxy, seen) = loaded(&mut harness, "https://img.test/broken.png", "image/png", &body);
    harness.settle();

    assert_eq!(seen.count(|n| matches!(n, Notification::Error(_))), 1);
    assert!(harness.loader().content_cache().is_empty());
    let drawn = harness.loader().draw(proxy, Size::new(8, 8), DecodeFlags::SYNC_DECODE, FrameSelection::Current).unwrap();
    assert_eq!(drawn.result, ImgDrawResult::BadImage);
    assert_eq!(seen.count(|n| matches!(n, Notification::Error(_))), 1);
}

#[test]
fn static_decode_failure_retries_once_then_errors() {
    let mut harness = Harness::new();
    let mut body = png(64, 64);
    body.truncate(body.len() - 16);
    let (proxy, seen) = loaded(&mut harness, "https://img.test/cut.png", "image/png", &body);
    assert!(seen.seen().contains(&Notification::SizeAvailable(Size::new(64, 64))));
    assert_eq!(seen.count(|n| matches!(n, Notification::Error(_))), 0);

    let size = Size::new(64, 64);
    harness.loader().lookup_frame(proxy, size, DecodeFlags::SYNC_DECODE, PlaybackType::Static).unwrap();
    harness.settle();

    assert_eq!(harness.context.pool().executed_count(), 2);
    let seen = seen.seen();
    let discard = seen.iter().position(|n| *n == Notification::Discard).expect("discard");
    let error = seen.iter().position(|n| matches!(n, Notification::Error(_))).expect("error");
    assert!(discard < error);
    assert_eq!(seen.iter().filter(|n| matches!(n, Notification::Error(_))).count(), 1);
    assert!(harness.loader().content_cache().is_empty());

    let drawn = harness.loader().draw(proxy, size, DecodeFlags::SYNC_DECODE, FrameSelection::Current).unwrap();
    assert_eq!(drawn.result, ImgDrawResult::BadImage);
    assert_eq!(harness.context.pool().executed_count(), 2);
}

#[test]
fn animated_decode_failure_errors_without_retry() {
    let mut harness = Harness::new();
    let mut body = gif(3, 100);
    body.truncate(body.len() - 6);
    let (proxy, seen) = loaded(&mut harness, "https://img.test/cut.gif", "image/gif", &body);
    assert!(seen.seen().contains(&Notification::IsAnimated));

    harness.loader().lookup_frame(proxy, Size::new(5, 5), DecodeFlags::SYNC_DECODE, PlaybackType::Animated).unwrap();
    harness.settle();

    assert_eq!(harness.context.pool().executed_count(), 1);
    assert_eq!(seen.count(|n| *n == Notification::Discard), 0);
    assert_eq!(seen.count(|n| matches!(n, Notification::Error(_))), 1);
    let image = image_id(&mut harness, proxy);
    assert_eq!(harness.context.surfaces().surface_count(image), 0);
}

#[test]
fn animated_images_decode_every_frame_and_advance() {
    let mut harness = Harness::new();
    let (proxy, seen) = loaded(&mut harness, "https://img.test/anim.gif", "image/gif", &gif(3, 500));
    assert!(seen.seen().contains(&Notification::IsAnimated));

    let size = Size::new(5, 5);
    let result = harness.loader().lookup_frame(proxy, size, DecodeFlags::SYNC_DECODE, PlaybackType::Animated).unwrap();
    assert!(result.is_found());

    let start = Instant::now();
    let animation = harness.loader().request_of(proxy).and_then(|r| r.image().animation().cloned()).expect("animation");
    assert_eq!(animation.frame_count(), 3);

    harness.loader().refresh_animations(start + Duration::from_millis(600));
    let frame = harness.loader().request_of(proxy).and_then(|r| r.image().animation().map(|a| a.current_frame()));
    assert_eq!(frame, Some(1));
    assert!(seen.seen().iter().filter(|n| matches!(n, Notification::FrameUpdate(_))).count() >= 2);
}

#[test]
fn memory_pressure_drops_unlocked_surfaces_only() {
    let config = ImageCacheConfig {
        decode: DecodePoolConfig { worker_threads: 1, sync_decode_pixel_limit: 1 << 20 },
        ..Default::default()
    };
    let mut harness = Harness::with_config(config);
    let (locked, _) = loaded(&mut harness, "https://img.test/locked.png", "image/png", &png(8, 8));
    let (loose, _) = loaded(&mut harness, "https://img.test/loose.png", "image/png", &png(8, 8));
    let size = Size::new(8, 8);
    harness.loader().lock_image(locked).unwrap();
    for proxy in [locked, loose] {
        harness.loader().lookup_frame(proxy, size, DecodeFlags::SYNC_DECODE, PlaybackType::Static).unwrap();
    }
    let locked_image = image_id(&mut harness, locked);
    let loose_image = image_id(&mut harness, loose);
    assert_eq!(harness.context.surfaces().surface_count(locked_image), 1);
    assert_eq!(harness.context.surfaces().surface_count(loose_image), 1);

    let freed = harness.context.on_memory_pressure();

    assert!(freed > 0);
    assert_eq!(harness.context.surfaces().surface_count(locked_image), 1);
    assert_eq!(harness.context.surfaces().surface_count(loose_image), 0);
    let still = harness.loader().lookup_frame(locked, size, DecodeFlags::empty(), PlaybackType::Static).unwrap();
    assert!(still.is_found());
}

#[test]
fn shutdown_releases_every_surface() {
    let mut harness = Harness::new();
    let (proxy, _) = loaded(&mut harness, "https://img.test/d.png", "image/png", &png(4, 4));
    harness.loader().lookup_frame(proxy, Size::new(4, 4), DecodeFlags::SYNC_DECODE, PlaybackType::Static).unwrap();
    assert!(harness.context.surfaces().total_cost() > 0);

    harness.context.shutdown();

    assert_eq!(harness.context.surfaces().total_cost(), 0);
    assert_eq!(harness.loader().request_count(), 0);
}
