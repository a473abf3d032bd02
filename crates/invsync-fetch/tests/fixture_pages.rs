use invsync_fetch::{fetch_with_retry, BackoffPolicy, FixtureFetcher, PageError, RecordFetcher, UnconfiguredFetcher};

fn write_page(dir: &std::path::Path, page: u32, body: &str) {
    std::fs::write(dir.join(format!("page-{page}.json")), body).unwrap();
}

#[tokio::test]
async fn fixture_listing_reads_until_the_first_missing_page() {
    let dir = tempfile::tempdir().unwrap();
    write_page(
        dir.path(),
        1,
        r#"[{"identifier":"1HGCM82633A004352","price":21995.0,"make":"Honda","model":"Accord","year":2021}]"#,
    );
    write_page(dir.path(), 2, r#"{"records":[{"identifier":"2T1BURHE0JC012345"}]}"#);
    let fetcher = FixtureFetcher::new(dir.path());

    let first = fetch_with_retry(&fetcher, 1, &BackoffPolicy::immediate(2)).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].normalized_price().map(|p| p.cents()), Some(2_199_500));

    let second = fetch_with_retry(&fetcher, 2, &BackoffPolicy::immediate(2)).await.unwrap();
    assert_eq!(second[0].identifier, "2T1BURHE0JC012345");
    assert_eq!(second[0].price, None);

    let past_end = fetch_with_retry(&fetcher, 3, &BackoffPolicy::immediate(2)).await.unwrap();
    assert!(past_end.is_empty());
}

#[tokio::test]
async fn malformed_fixture_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    write_page(dir.path(), 1, "{ not json");
    let fetcher = FixtureFetcher::new(dir.path());

    let failure = fetch_with_retry(&fetcher, 1, &BackoffPolicy::immediate(3)).await.unwrap_err();
    assert_eq!(failure.attempts, 1);
    assert!(matches!(failure.last, PageError::Decode { page: 1, .. }));
}

#[tokio::test]
async fn unconfigured_source_fails_every_page_once() {
    let fetcher = UnconfiguredFetcher;
    assert_eq!(fetcher.source_name(), "unconfigured");

    let failure = fetch_with_retry(&fetcher, 7, &BackoffPolicy::immediate(3)).await.unwrap_err();
    assert_eq!(failure.page, 7);
    assert_eq!(failure.attempts, 1);
    assert!(failure.to_string().contains("no record source configured"));
}
