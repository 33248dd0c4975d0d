//! Integration tests using wiremock to simulate the metadata server.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Request, Response};
use scoped_env::ScopedEnv;
use serde::Deserialize;
use serial_test::{parallel, serial};
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

use gce_metadata::{
    default_http_client, BoxError, MetadataClient, MetadataError, Transport, UserAgent,
    METADATA_HOST_ENV,
};

/// Test configuration struct for JSON deserialization tests.
#[derive(Debug, Deserialize, PartialEq)]
struct TestConfig {
    db_host: String,
    port: u16,
}

fn client_for(server: &MockServer) -> MetadataClient {
    MetadataClient::http()
        .unwrap()
        .with_host(server.address().to_string())
}

async fn mount_value(server: &MockServer, suffix: &str, value: &str) {
    Mock::given(method("GET"))
        .and(path(format!("/computeMetadata/v1/{}", suffix)))
        .and(header("Metadata-Flavor", "Google"))
        .respond_with(ResponseTemplate::new(200).set_body_string(value))
        .mount(server)
        .await;
}

// =============================================================================
// Requests
// =============================================================================

mod requests {
    use super::*;

    #[tokio::test]
    #[parallel]
    async fn test_get_sends_flavor_header() {
        let server = MockServer::start().await;
        mount_value(&server, "instance/hostname", "vm-1.c.proj.internal\n").await;

        let value = client_for(&server).get("instance/hostname").await.unwrap();

        assert_eq!(value, "vm-1.c.proj.internal");
    }

    #[tokio::test]
    #[parallel]
    async fn test_get_without_flavor_match_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Metadata-Flavor", "Other"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let err = client_for(&server).get("instance/id").await.unwrap_err();

        assert_eq!(err.status(), Some(404));
    }

    #[tokio::test]
    #[parallel]
    async fn test_leading_slash_hits_same_path() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/computeMetadata/v1/instance/service-accounts/default/identity"))
            .and(query_param("audience", "http://example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_string("token"))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let suffix = "instance/service-accounts/default/identity?audience=http://example.com";
        assert_eq!(client.get(suffix).await.unwrap(), "token");
        assert_eq!(client.get(&format!("/{}", suffix)).await.unwrap(), "token");
    }

    #[tokio::test]
    #[parallel]
    async fn test_server_error_keeps_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend exploded"))
            .mount(&server)
            .await;

        match client_for(&server).get("instance/id").await {
            Err(MetadataError::Status { code, body }) => {
                assert_eq!(code, 500);
                assert_eq!(body, "backend exploded");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    #[parallel]
    async fn test_connection_refused_is_transport_error() {
        let client = MetadataClient::http().unwrap().with_host("127.0.0.1:9");

        let result = client.get("instance/id").await;

        assert!(matches!(result, Err(MetadataError::Transport(_))));
    }

    #[tokio::test]
    #[serial]
    async fn test_env_host_redirects_client() {
        let server = MockServer::start().await;
        mount_value(&server, "project/project-id", "from-env").await;
        let addr = server.address().to_string();
        let _e = ScopedEnv::set(METADATA_HOST_ENV, &addr);

        let client = MetadataClient::http().unwrap().with_host("127.0.0.1:9");

        assert_eq!(client.project_id().await.unwrap(), "from-env");
    }
}

// =============================================================================
// User-Agent decorator
// =============================================================================

mod user_agent {
    use super::*;

    #[tokio::test]
    #[parallel]
    async fn test_user_agent_reaches_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("User-Agent", "my-user-agent"))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let transport = UserAgent::new("my-user-agent", default_http_client().unwrap()).unwrap();
        let client = MetadataClient::new(transport).with_host(server.address().to_string());

        assert_eq!(client.get("foo").await.unwrap(), "ok");
    }

    #[derive(Debug, Default)]
    struct Capture {
        user_agent: Mutex<Option<String>>,
    }

    #[async_trait]
    impl Transport for Capture {
        async fn round_trip(&self, request: Request) -> Result<Response, BoxError> {
            *self.user_agent.lock().unwrap() = request
                .headers()
                .get("User-Agent")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            Ok(http::Response::new("").into())
        }
    }

    #[tokio::test]
    #[parallel]
    async fn test_user_agent_seen_by_innermost_transport() {
        let capture = Arc::new(Capture::default());
        let client = MetadataClient::new(UserAgent::new("my-user-agent", Arc::clone(&capture)).unwrap());

        client.get("foo").await.unwrap();

        assert_eq!(
            capture.user_agent.lock().unwrap().as_deref(),
            Some("my-user-agent")
        );
    }

    #[tokio::test]
    #[parallel]
    async fn test_default_user_agent() {
        let capture = Arc::new(Capture::default());
        let client = MetadataClient::new(Arc::clone(&capture));

        client.get("foo").await.unwrap();

        let user_agent = capture.user_agent.lock().unwrap().clone().unwrap();
        assert!(user_agent.starts_with("gce-metadata/"));
    }
}

// =============================================================================
// Accessors
// =============================================================================

mod accessors {
    use super::*;

    #[tokio::test]
    #[parallel]
    async fn test_project_ids() {
        let server = MockServer::start().await;
        mount_value(&server, "project/project-id", "my-project\n").await;
        mount_value(&server, "project/numeric-project-id", " 123456789 ").await;

        let client = client_for(&server);
        assert_eq!(client.project_id().await.unwrap(), "my-project");
        assert_eq!(client.numeric_project_id().await.unwrap(), "123456789");
    }

    #[tokio::test]
    #[parallel]
    async fn test_instance_identity() {
        let server = MockServer::start().await;
        mount_value(&server, "instance/id", "4520031799277581759").await;
        mount_value(&server, "instance/name", "vm-1").await;
        mount_value(&server, "instance/hostname", "vm-1.c.my-project.internal").await;
        mount_value(&server, "instance/zone", "projects/123456789/zones/us-central1-b").await;

        let client = client_for(&server);
        assert_eq!(client.instance_id().await.unwrap(), "4520031799277581759");
        assert_eq!(client.instance_name().await.unwrap(), "vm-1");
        assert_eq!(
            client.hostname().await.unwrap(),
            "vm-1.c.my-project.internal"
        );
        assert_eq!(client.zone().await.unwrap(), "us-central1-b");
    }

    #[tokio::test]
    #[parallel]
    async fn test_network_addresses() {
        let server = MockServer::start().await;
        mount_value(&server, "instance/network-interfaces/0/ip", "10.128.0.2").await;
        mount_value(
            &server,
            "instance/network-interfaces/0/access-configs/0/external-ip",
            "34.1.2.3",
        )
        .await;

        let client = client_for(&server);
        assert_eq!(client.internal_ip().await.unwrap(), "10.128.0.2");
        assert_eq!(client.external_ip().await.unwrap(), "34.1.2.3");
    }

    #[tokio::test]
    #[parallel]
    async fn test_service_accounts() {
        let server = MockServer::start().await;
        mount_value(
            &server,
            "instance/service-accounts/default/email",
            "123-compute@developer.gserviceaccount.com",
        )
        .await;
        mount_value(
            &server,
            "instance/service-accounts/robot/scopes",
            "https://www.googleapis.com/auth/cloud-platform\nhttps://www.googleapis.com/auth/userinfo.email\n",
        )
        .await;

        let client = client_for(&server);
        assert_eq!(
            client.email("").await.unwrap(),
            "123-compute@developer.gserviceaccount.com"
        );
        assert_eq!(
            client.scopes("robot").await.unwrap(),
            vec![
                "https://www.googleapis.com/auth/cloud-platform".to_string(),
                "https://www.googleapis.com/auth/userinfo.email".to_string(),
            ]
        );
    }

    #[tokio::test]
    #[parallel]
    async fn test_instance_tags() {
        let server = MockServer::start().await;
        mount_value(&server, "instance/tags", r#"["http-server","https-server"]"#).await;

        let tags = client_for(&server).instance_tags().await.unwrap();

        assert_eq!(tags, vec!["http-server", "https-server"]);
    }

    #[tokio::test]
    #[parallel]
    async fn test_attribute_listings() {
        let server = MockServer::start().await;
        mount_value(&server, "instance/attributes/", "enable-oslogin\nstartup-script\n").await;
        mount_value(&server, "project/attributes/", "ssh-keys\n").await;

        let client = client_for(&server);
        assert_eq!(
            client.instance_attributes().await.unwrap(),
            vec!["enable-oslogin", "startup-script"]
        );
        assert_eq!(client.project_attributes().await.unwrap(), vec!["ssh-keys"]);
    }

    #[tokio::test]
    #[parallel]
    async fn test_attribute_values() {
        let server = MockServer::start().await;
        mount_value(&server, "instance/attributes/my-key", "my-value").await;
        mount_value(&server, "project/attributes/project-config", "project-value").await;

        let client = client_for(&server);
        assert_eq!(
            client.instance_attribute_value("my-key").await.unwrap(),
            "my-value"
        );
        assert_eq!(
            client
                .project_attribute_value("project-config")
                .await
                .unwrap(),
            "project-value"
        );
    }

    #[tokio::test]
    #[parallel]
    async fn test_attribute_as_json() {
        let server = MockServer::start().await;
        let config = r#"{"db_host": "postgres.internal", "port": 5432}"#;
        mount_value(&server, "instance/attributes/config", config).await;

        let config: TestConfig = client_for(&server)
            .instance_attribute_json("config")
            .await
            .unwrap();

        assert_eq!(
            config,
            TestConfig {
                db_host: "postgres.internal".to_string(),
                port: 5432,
            }
        );
    }

    #[tokio::test]
    #[parallel]
    async fn test_attribute_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/computeMetadata/v1/instance/attributes/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .instance_attribute_value("missing")
            .await
            .unwrap_err();

        assert!(err.is_not_defined());
    }

    #[tokio::test]
    #[parallel]
    async fn test_invalid_json_attribute() {
        let server = MockServer::start().await;
        mount_value(&server, "instance/attributes/config", "not json").await;

        let result: Result<TestConfig, _> =
            client_for(&server).instance_attribute_json("config").await;

        assert!(matches!(result, Err(MetadataError::Json(_))));
    }
}

// =============================================================================
// Subscriptions
// =============================================================================

mod subscribe {
    use super::*;

    #[derive(Debug)]
    enum Stop {
        Done,
        Metadata(MetadataError),
    }

    impl From<MetadataError> for Stop {
        fn from(e: MetadataError) -> Self {
            Stop::Metadata(e)
        }
    }

    const SUFFIX: &str = "instance/attributes/flag";

    #[tokio::test]
    #[parallel]
    async fn test_subscribe_follows_changes() {
        let server = MockServer::start().await;
        let full_path = format!("/computeMetadata/v1/{}", SUFFIX);

        Mock::given(method("GET"))
            .and(path(full_path.as_str()))
            .and(query_param_is_missing("wait_for_change"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "etag-1")
                    .set_body_string("on"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(full_path.as_str()))
            .and(query_param("wait_for_change", "true"))
            .and(query_param("last_etag", "etag-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("ETag", "etag-2")
                    .set_body_string("off"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(full_path.as_str()))
            .and(query_param("wait_for_change", "true"))
            .and(query_param("last_etag", "etag-2"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut seen = Vec::new();
        let result = client_for(&server)
            .subscribe(SUFFIX, |value, exists| {
                seen.push((value.to_string(), exists));
                if seen.len() == 3 {
                    Err(Stop::Done)
                } else {
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(Stop::Done)));
        assert_eq!(
            seen,
            vec![
                ("on".to_string(), true),
                ("off".to_string(), true),
                (String::new(), false),
            ]
        );
    }

    #[tokio::test]
    #[parallel]
    async fn test_subscribe_initial_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let mut calls = 0;
        let result = client_for(&server)
            .subscribe(SUFFIX, |_, _| -> Result<(), Stop> {
                calls += 1;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Stop::Metadata(e)) if e.is_not_defined()));
        assert_eq!(calls, 0);
    }
}
