mod common;

use common::{credentials, PublishStep, ScriptedApi};
use std::time::Duration;
use threadchain::config::Pacing;
use threadchain::platform::ContainerRequest;
use threadchain::publisher::Publisher;
use threadchain::{ChainItem, MediaType, PublishError};
use tokio::time::Instant;

fn publisher(api: &std::sync::Arc<ScriptedApi>) -> Publisher {
    Publisher::new(api.clone(), Pacing::default())
}

#[tokio::test(start_paused = true)]
async fn publish_retries_without_recreating_container() {
    let api = ScriptedApi::new();
    api.script_publish(&[PublishStep::Status(500); 4]);

    let start = Instant::now();
    let post_id = publisher(&api)
        .publish(&ChainItem::text(0, "hello"), &credentials(), None)
        .await
        .unwrap();

    assert_eq!(post_id, "post-c1");
    assert_eq!(api.creates().len(), 1);

    let publishes = api.publishes();
    assert_eq!(publishes.len(), 5);
    assert!(publishes.iter().all(|(creation_id, _)| creation_id == "c1"));

    // Four 5s waits between five attempts on a text post.
    for pair in publishes.windows(2) {
        assert_eq!(pair[1].1 - pair[0].1, Duration::from_secs(5));
    }
    assert!(start.elapsed() >= Duration::from_secs(20));
    assert!(start.elapsed() < Duration::from_secs(21));
}

#[tokio::test(start_paused = true)]
async fn media_posts_wait_longer_between_attempts() {
    let api = ScriptedApi::new();
    api.script_publish(&[PublishStep::Malformed]);

    let item = ChainItem::with_media(
        0,
        "photo",
        MediaType::Image,
        vec!["https://cdn.example.com/a.jpg".into()],
    );
    publisher(&api).publish(&item, &credentials(), None).await.unwrap();

    let publishes = api.publishes();
    assert_eq!(publishes.len(), 2);
    assert_eq!(publishes[1].1 - publishes[0].1, Duration::from_secs(10));
}

#[tokio::test(start_paused = true)]
async fn publish_gives_up_after_five_attempts() {
    let api = ScriptedApi::new();
    api.script_publish(&[PublishStep::Status(503); 5]);

    let err = publisher(&api)
        .publish(&ChainItem::text(0, "hello"), &credentials(), None)
        .await
        .unwrap_err();

    match err {
        PublishError::PublishExhausted { attempts, last } => {
            assert_eq!(attempts, 5);
            assert!(last.contains("503"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(api.publishes().len(), 5);
    assert_eq!(api.creates().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn carousel_creates_children_one_second_apart() {
    let api = ScriptedApi::new();
    let item = ChainItem::with_media(
        0,
        "album",
        MediaType::Carousel,
        vec![
            "https://cdn.example.com/1.jpg".into(),
            "https://cdn.example.com/2.jpg".into(),
            "https://cdn.example.com/3.mp4".into(),
        ],
    );

    let post_id = publisher(&api)
        .publish(&item, &credentials(), Some("root-1"))
        .await
        .unwrap();
    assert_eq!(post_id, "post-c4");

    let creates = api.creates();
    assert_eq!(creates.len(), 4);
    assert!(creates[..3]
        .iter()
        .all(|(request, _)| matches!(request, ContainerRequest::CarouselItem { .. })));
    assert_eq!(creates[1].1 - creates[0].1, Duration::from_secs(1));
    assert_eq!(creates[2].1 - creates[1].1, Duration::from_secs(1));

    assert_eq!(
        creates[3].0,
        ContainerRequest::Carousel {
            text: "album".into(),
            children: vec!["c1".into(), "c2".into(), "c3".into()],
            reply_to_id: Some("root-1".into()),
        }
    );
    assert_eq!(api.publishes().len(), 1);
}

#[tokio::test]
async fn invalid_item_never_reaches_the_platform() {
    let api = ScriptedApi::new();
    let item = ChainItem::with_media(
        0,
        "text only",
        MediaType::Text,
        vec!["https://cdn.example.com/a.jpg".into()],
    );

    let err = publisher(&api)
        .publish(&item, &credentials(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::InvalidItem(_)));
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn container_failure_is_not_retried() {
    let api = ScriptedApi::new();
    api.fail_text("rejected");

    let err = publisher(&api)
        .publish(&ChainItem::text(0, "rejected"), &credentials(), None)
        .await
        .unwrap_err();

    assert!(matches!(err, PublishError::ContainerCreationFailed(_)));
    assert_eq!(api.creates().len(), 1);
    assert!(api.publishes().is_empty());
}
