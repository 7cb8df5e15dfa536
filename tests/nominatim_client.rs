use std::time::Duration;

use httptest::matchers::{all_of, contains, key, request, url_decoded};
use httptest::responders::{delay_and_then, json_encoded, status_code};
use httptest::{Expectation, Server};
use serde_json::json;

use district_geocache::{GeocodeLookup, NominatimClient, ResolutionFailure};

fn client_for(server: &Server, timeout: Duration) -> NominatimClient {
    NominatimClient::new(&server.url_str("/"), "pba_mapa_test", timeout).expect("client")
}

#[tokio::test]
async fn resolves_first_search_hit() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "La Plata, Buenos Aires, Argentina")))),
            request::query(url_decoded(contains(("format", "jsonv2")))),
            request::query(url_decoded(contains(("limit", "1")))),
            request::headers(contains(key("user-agent"))),
        ))
        .respond_with(json_encoded(json!([
            { "lat": "-34.9206797", "lon": "-57.9537638", "display_name": "La Plata" }
        ]))),
    );

    let client = client_for(&server, Duration::from_secs(5));
    let coordinate = client
        .geocode("La Plata, Buenos Aires, Argentina")
        .await
        .expect("resolved");
    assert!((coordinate.lat() + 34.9206797).abs() < 1e-9);
    assert!((coordinate.lon() + 57.9537638).abs() < 1e-9);
}

#[tokio::test]
async fn empty_result_is_not_found() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/search"))
            .respond_with(json_encoded(json!([]))),
    );

    let client = client_for(&server, Duration::from_secs(5));
    assert_eq!(
        client.geocode("Nowhere, Buenos Aires, Argentina").await,
        Err(ResolutionFailure::NotFound)
    );
}

#[tokio::test]
async fn too_many_requests_is_rate_limited() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/search"))
            .respond_with(status_code(429).append_header("Retry-After", "7")),
    );

    let client = client_for(&server, Duration::from_secs(5));
    assert_eq!(
        client.geocode("Azul, Buenos Aires, Argentina").await,
        Err(ResolutionFailure::RateLimited {
            retry_after: Some(Duration::from_secs(7))
        })
    );
}

#[tokio::test]
async fn server_errors_and_garbage_are_transient() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "Broken")))),
        ))
        .respond_with(status_code(503)),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "Garbage")))),
        ))
        .respond_with(status_code(200).body("<html>maintenance</html>")),
    );
    server.expect(
        Expectation::matching(all_of!(
            request::method_path("GET", "/search"),
            request::query(url_decoded(contains(("q", "OffTheMap")))),
        ))
        .respond_with(json_encoded(json!([{ "lat": "123.0", "lon": "10.0" }]))),
    );

    let client = client_for(&server, Duration::from_secs(5));
    for query in ["Broken", "Garbage", "OffTheMap"] {
        let outcome = client.geocode(query).await;
        assert!(
            matches!(outcome, Err(ResolutionFailure::Transient(_))),
            "{query}: {outcome:?}"
        );
    }
}

#[tokio::test]
async fn slow_responses_time_out_as_transient() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("GET", "/search")).respond_with(
            delay_and_then(Duration::from_secs(2), json_encoded(json!([]))),
        ),
    );

    let client = client_for(&server, Duration::from_millis(200));
    let outcome = client.geocode("Slow").await;
    assert!(matches!(outcome, Err(ResolutionFailure::Transient(_))));
}

#[tokio::test]
async fn unreachable_service_is_transient() {
    let client = NominatimClient::new("http://127.0.0.1:9", "pba_mapa_test", Duration::from_secs(2))
        .expect("client");
    let outcome = client.geocode("Azul").await;
    assert!(matches!(outcome, Err(ResolutionFailure::Transient(_))));
}
