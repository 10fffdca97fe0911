/*
    Federation metadata retrieval. The document format is the one ADFS and friends publish at
    /FederationMetadata/2007-06/FederationMetadata.xml: an EntityDescriptor whose entityID is the
    token issuer, KeyDescriptors carrying X.509 signing certificates, and a RoleDescriptor with
    the passive requestor endpoint browsers are redirected to.
*/

use async_trait::async_trait;
use quick_xml::{
    events::{BytesStart, Event},
    Reader,
};
use reqwest::Url;
use std::{collections::BTreeSet, time::Duration};

use crate::{
    data_model::{FederationMetadata, SigningKey},
    error::{FederationError, FederationResult},
};

const PASSIVE_ENDPOINT_PATH: [&[u8]; 3] =
    [b"PassiveRequestorEndpoint", b"EndpointReference", b"Address"];

/// Where federation metadata comes from. Production uses [`HttpMetadataSource`].
#[mockall::automock]
#[async_trait]
pub trait MetadataSource: std::fmt::Debug + Send + Sync {
    async fn fetch_metadata(&self, address: &Url) -> FederationResult<FederationMetadata>;
}

#[derive(Clone, Debug)]
pub struct HttpMetadataSource(pub reqwest::Client);

impl HttpMetadataSource {
    pub fn new(timeout: Duration) -> FederationResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FederationError::Configuration(format!("http client: {err}")))?;
        Ok(Self(client))
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    #[tracing::instrument(skip_all, fields(address = %address), err(level = "warn"))]
    async fn fetch_metadata(&self, address: &Url) -> FederationResult<FederationMetadata> {
        let unreachable =
            |err: reqwest::Error| FederationError::MetadataUnreachable(err.to_string());
        let document = self
            .0
            .get(address.clone())
            .header(reqwest::header::USER_AGENT, "wsfed-webapp")
            .header(reqwest::header::ACCEPT, "application/samlmetadata+xml, application/xml")
            .send()
            .await
            .map_err(unreachable)?
            .error_for_status()
            .map_err(unreachable)?
            .bytes()
            .await
            .map_err(unreachable)?;
        let document = std::str::from_utf8(&document).map_err(|err| {
            FederationError::MetadataMalformed(format!("document is not utf-8: {err}"))
        })?;
        parse_federation_metadata(document)
    }
}

fn malformed(err: impl std::fmt::Display) -> FederationError {
    FederationError::MetadataMalformed(err.to_string())
}

fn attribute(element: &BytesStart, name: &str) -> FederationResult<Option<String>> {
    element
        .try_get_attribute(name)
        .map_err(malformed)?
        .map(|attr| attr.unescape_value().map(|value| value.into_owned()))
        .transpose()
        .map_err(malformed)
}

fn in_passive_endpoint_address(open: &[Vec<u8>]) -> bool {
    open.len() >= PASSIVE_ENDPOINT_PATH.len()
        && open[open.len() - PASSIVE_ENDPOINT_PATH.len()..]
            .iter()
            .zip(PASSIVE_ENDPOINT_PATH)
            .all(|(open, expected)| open.as_slice() == expected)
}

/// Pulls the issuer, signing keys and passive endpoint out of a metadata document.
pub fn parse_federation_metadata(xml: &str) -> FederationResult<FederationMetadata> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut issuer = None;
    let mut signing_keys = BTreeSet::new();
    let mut passive_endpoint = None;
    // local names of the open elements
    let mut open: Vec<Vec<u8>> = Vec::new();
    let mut in_signing_descriptor = false;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(element) => {
                let name = element.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"EntityDescriptor" if open.is_empty() => {
                        issuer = attribute(&element, "entityID")?;
                    }
                    b"KeyDescriptor" => {
                        // use is optional, absent means the key serves both purposes
                        in_signing_descriptor = attribute(&element, "use")?
                            .map_or(true, |key_use| key_use == "signing");
                    }
                    _ => {}
                }
                open.push(name);
            }
            Event::Empty(element) => {
                if open.is_empty() && element.local_name().as_ref() == b"EntityDescriptor" {
                    issuer = attribute(&element, "entityID")?;
                }
            }
            Event::Text(text) => {
                let current = open.last().map(Vec::as_slice);
                if in_signing_descriptor && current == Some(b"X509Certificate".as_slice()) {
                    let text = text.unescape().map_err(malformed)?;
                    signing_keys.insert(SigningKey::from_certificate_base64(&text)?);
                } else if passive_endpoint.is_none() && in_passive_endpoint_address(&open) {
                    let text = text.unescape().map_err(malformed)?;
                    passive_endpoint = Some(Url::parse(text.trim()).map_err(|err| {
                        malformed(format!("passive requestor endpoint {text:?}: {err}"))
                    })?);
                }
            }
            Event::End(_) => {
                if open.pop().as_deref() == Some(b"KeyDescriptor".as_slice()) {
                    in_signing_descriptor = false;
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let issuer = issuer
        .filter(|issuer| !issuer.trim().is_empty())
        .ok_or_else(|| malformed("EntityDescriptor with an entityID not found"))?;
    tracing::debug!(
        issuer = %issuer,
        signing_keys = signing_keys.len(),
        passive_endpoint = ?passive_endpoint.as_ref().map(Url::as_str),
        "parsed federation metadata"
    );
    Ok(FederationMetadata {
        issuer,
        signing_keys,
        passive_endpoint,
    })
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::data_model::tests::{idp_key, rogue_key};
    use axum::{http::StatusCode, routing::get, Router};

    pub const METADATA_XML: &str = include_str!("../test_data/federation_metadata.xml");
    pub const METADATA_ISSUER: &str = "http://adfs.example.com/adfs/services/trust";

    pub fn test_metadata() -> FederationMetadata {
        parse_federation_metadata(METADATA_XML).unwrap()
    }

    #[test]
    fn test_parse_metadata() {
        let metadata = test_metadata();
        assert_eq!(metadata.issuer, METADATA_ISSUER);
        // the signing cert appears twice, the rogue one only as encryption key and in the signature
        assert_eq!(metadata.signing_keys, BTreeSet::from([idp_key()]));
        assert!(!metadata.signing_keys.contains(&rogue_key()));
        assert_eq!(
            metadata.passive_endpoint.unwrap().as_str(),
            "https://adfs.example.com/adfs/ls/"
        );
    }

    #[test]
    fn test_parse_prefixed_minimal_metadata() {
        let xml = r#"<md:EntityDescriptor xmlns:md="urn:oasis:names:tc:SAML:2.0:metadata" entityID="https://idp.example.com/"/>"#;
        let metadata = parse_federation_metadata(xml).unwrap();
        assert_eq!(metadata.issuer, "https://idp.example.com/");
        assert!(metadata.signing_keys.is_empty());
        assert!(metadata.passive_endpoint.is_none());
    }

    #[test]
    fn test_parse_missing_entity_id() {
        let xml = r#"<EntityDescriptor xmlns="urn:oasis:names:tc:SAML:2.0:metadata"><RoleDescriptor/></EntityDescriptor>"#;
        assert!(matches!(
            parse_federation_metadata(xml),
            Err(FederationError::MetadataMalformed(_))
        ));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(matches!(
            parse_federation_metadata(
                "<EntityDescriptor entityID=\"x\"><Unclosed></EntityDescriptor>"
            ),
            Err(FederationError::MetadataMalformed(_))
        ));
        assert!(matches!(
            parse_federation_metadata("{\"issuer\": \"json is not metadata\"}"),
            Err(FederationError::MetadataMalformed(_))
        ));
    }

    #[test]
    fn test_parse_bad_certificate() {
        let xml = r#"<EntityDescriptor entityID="https://idp"><RoleDescriptor><KeyDescriptor use="signing"><KeyInfo><X509Data><X509Certificate>AAAA</X509Certificate></X509Data></KeyInfo></KeyDescriptor></RoleDescriptor></EntityDescriptor>"#;
        assert!(matches!(
            parse_federation_metadata(xml),
            Err(FederationError::MetadataMalformed(_))
        ));
    }

    async fn serve(router: Router) -> Url {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        Url::parse(&format!("http://{addr}/FederationMetadata/2007-06/FederationMetadata.xml"))
            .unwrap()
    }

    #[tokio::test]
    async fn test_http_source_fetches_and_parses() {
        let address = serve(Router::new().route(
            "/FederationMetadata/2007-06/FederationMetadata.xml",
            get(|| async { METADATA_XML }),
        ))
        .await;
        let source = HttpMetadataSource::new(Duration::from_secs(5)).unwrap();
        let metadata = source.fetch_metadata(&address).await.unwrap();
        assert_eq!(metadata, test_metadata());
    }

    #[tokio::test]
    async fn test_http_source_error_status_is_unreachable() {
        let address = serve(Router::new().route(
            "/FederationMetadata/2007-06/FederationMetadata.xml",
            get(|| async { (StatusCode::SERVICE_UNAVAILABLE, "down for maintenance") }),
        ))
        .await;
        let source = HttpMetadataSource::new(Duration::from_secs(5)).unwrap();
        let err = source.fetch_metadata(&address).await.unwrap_err();
        assert!(matches!(err, FederationError::MetadataUnreachable(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_http_source_html_is_malformed() {
        let address = serve(Router::new().route(
            "/FederationMetadata/2007-06/FederationMetadata.xml",
            get(|| async { "<html><body>Sign in</body></html>" }),
        ))
        .await;
        let source = HttpMetadataSource::new(Duration::from_secs(5)).unwrap();
        let err = source.fetch_metadata(&address).await.unwrap_err();
        assert!(matches!(err, FederationError::MetadataMalformed(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_http_source_connection_refused_is_unreachable() {
        // bind then drop so the port is very likely closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let address = Url::parse(&format!("http://{addr}/metadata.xml")).unwrap();
        let source = HttpMetadataSource::new(Duration::from_secs(2)).unwrap();
        let err = source.fetch_metadata(&address).await.unwrap_err();
        assert!(err.is_retryable(), "{err:?}");
    }
}
