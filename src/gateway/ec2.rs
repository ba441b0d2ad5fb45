//! EC2 Query API gateway.
//!
//! Speaks the form-encoded POST dialect of the EC2 API directly: requests
//! are signed with SigV4, responses are XML documents whose element names
//! are matched by local name so the versioned namespace does not matter.
use super::credentials::Credentials;
use super::sigv4::{self, SigningScope};
use super::{
    GatewayError, InstanceQuery, ResourceGateway, SnapshotQuery, VolumeQuery, MAX_FILTER_VALUES,
};
use crate::model::{Attachment, Instance, Snapshot, TagMap, Volume, VolumeStatus};
use roxmltree::{Document, Node};
use std::time::Duration;

const API_VERSION: &str = "2016-11-15";
const SERVICE: &str = "ec2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RESPONSE_BYTES: u64 = 64 * 1024 * 1024;

const VOLUME_PAGE_SIZE: usize = 500;
const INSTANCE_PAGE_SIZE: usize = 1000;
const SNAPSHOT_PAGE_SIZE: usize = 1000;
const TAG_PAGE_SIZE: usize = 1000;

type Params = Vec<(String, String)>;

pub(crate) struct Ec2Gateway {
    agent: ureq::Agent,
    region: String,
    host: String,
    credentials: Credentials,
}

impl Ec2Gateway {
    pub(crate) fn new(region: &str, credentials: Credentials) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(REQUEST_TIMEOUT))
            .http_status_as_error(false)
            .build()
            .into();
        Self {
            agent,
            region: region.to_string(),
            host: endpoint_host(region),
            credentials,
        }
    }

    /// POST one API action and return the raw response document.
    fn call(&self, action: &str, params: &[(String, String)]) -> Result<String, GatewayError> {
        let body = form_body(action, params);
        let scope = SigningScope {
            host: &self.host,
            region: &self.region,
            service: SERVICE,
            now: chrono::Utc::now(),
        };
        let headers = sigv4::sign_form_post(&self.credentials, &scope, &body)
            .map_err(|err| GatewayError::InvalidRequest(format!("sign request: {err}")))?;
        tracing::debug!(action, host = self.host.as_str(), "calling EC2");

        let mut request = self.agent.post(format!("https://{}/", self.host));
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let mut response = request
            .send(body)
            .map_err(|err| GatewayError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .body_mut()
            .with_config()
            .limit(MAX_RESPONSE_BYTES)
            .read_to_string()
            .map_err(|err| GatewayError::Transport(format!("read response: {err}")))?;
        if !(200..300).contains(&status) {
            return Err(parse_error(status, &text));
        }
        Ok(text)
    }

    /// Call a Describe action, following `nextToken` until exhausted.
    fn describe<T>(
        &self,
        action: &str,
        params: Params,
        page_size: usize,
        parse_page: impl Fn(&Document<'_>) -> Result<Vec<T>, GatewayError>,
    ) -> Result<Vec<T>, GatewayError> {
        drain_pages(
            params,
            page_size,
            |page_params| self.call(action, page_params),
            parse_page,
        )
    }
}

/// Fetch pages until one comes back without a `nextToken`, collecting the
/// parsed items of every page in order.
fn drain_pages<T>(
    mut params: Params,
    page_size: usize,
    mut fetch: impl FnMut(&[(String, String)]) -> Result<String, GatewayError>,
    parse_page: impl Fn(&Document<'_>) -> Result<Vec<T>, GatewayError>,
) -> Result<Vec<T>, GatewayError> {
    params.push(("MaxResults".to_string(), page_size.to_string()));
    let mut items = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let mut page_params = params.clone();
        if let Some(token) = next_token.take() {
            page_params.push(("NextToken".to_string(), token));
        }
        let text = fetch(&page_params)?;
        let doc = parse_document(&text)?;
        items.extend(parse_page(&doc)?);
        match child_text(doc.root_element(), "nextToken").filter(|t| !t.is_empty()) {
            Some(token) => next_token = Some(token.to_string()),
            None => return Ok(items),
        }
    }
}

impl ResourceGateway for Ec2Gateway {
    fn list_volumes(&self, query: VolumeQuery<'_>) -> Result<Vec<Volume>, GatewayError> {
        let params = match query {
            VolumeQuery::All => Params::new(),
            VolumeQuery::Ids(ids) => filter_params(&[("volume-id", ids)])?,
            VolumeQuery::AttachedTo(ids) => filter_params(&[("attachment.instance-id", ids)])?,
        };
        self.describe("DescribeVolumes", params, VOLUME_PAGE_SIZE, parse_volumes)
    }

    fn list_instances(&self, query: InstanceQuery<'_>) -> Result<Vec<Instance>, GatewayError> {
        let params = match query {
            InstanceQuery::All => Params::new(),
            InstanceQuery::Ids(ids) => filter_params(&[("instance-id", ids)])?,
            InstanceQuery::Filter(filter) => {
                let filters: Vec<(&str, &[String])> = filter
                    .iter()
                    .map(|(name, values)| (name.as_str(), values.as_slice()))
                    .collect();
                filter_params(&filters)?
            }
        };
        self.describe("DescribeInstances", params, INSTANCE_PAGE_SIZE, parse_instances)
    }

    fn list_snapshots(&self, query: SnapshotQuery<'_>) -> Result<Vec<Snapshot>, GatewayError> {
        let mut params = match query {
            SnapshotQuery::All => Params::new(),
            SnapshotQuery::Ids(ids) => filter_params(&[("snapshot-id", ids)])?,
        };
        params.push(("Owner.1".to_string(), "self".to_string()));
        self.describe("DescribeSnapshots", params, SNAPSHOT_PAGE_SIZE, parse_snapshots)
    }

    fn resource_tags(&self, resource_id: &str) -> Result<TagMap, GatewayError> {
        let ids = [resource_id.to_string()];
        let params = filter_params(&[("resource-id", ids.as_slice())])?;
        let pairs = self.describe("DescribeTags", params, TAG_PAGE_SIZE, parse_tag_descriptions)?;
        Ok(pairs.into_iter().collect())
    }

    fn write_tags(&self, resource_id: &str, tags: &TagMap) -> Result<(), GatewayError> {
        if tags.is_empty() {
            return Ok(());
        }
        self.call("CreateTags", &create_tags_params(resource_id, tags))?;
        Ok(())
    }
}

fn endpoint_host(region: &str) -> String {
    if region.starts_with("cn-") {
        format!("ec2.{region}.amazonaws.com.cn")
    } else {
        format!("ec2.{region}.amazonaws.com")
    }
}

fn form_body(action: &str, params: &[(String, String)]) -> String {
    let mut pairs = vec![
        format!("Action={}", urlencoding::encode(action)),
        format!("Version={API_VERSION}"),
    ];
    pairs.extend(params.iter().map(|(key, value)| {
        format!("{}={}", urlencoding::encode(key), urlencoding::encode(value))
    }));
    pairs.join("&")
}

/// `Filter.N.Name` / `Filter.N.Value.M` parameters, numbered from 1.
fn filter_params(filters: &[(&str, &[String])]) -> Result<Params, GatewayError> {
    let mut params = Params::new();
    for (index, (name, values)) in filters.iter().enumerate() {
        if values.len() > MAX_FILTER_VALUES {
            return Err(GatewayError::InvalidRequest(format!(
                "filter {name} carries {} values, limit is {MAX_FILTER_VALUES}",
                values.len()
            )));
        }
        let n = index + 1;
        params.push((format!("Filter.{n}.Name"), name.to_string()));
        for (value_index, value) in values.iter().enumerate() {
            params.push((format!("Filter.{n}.Value.{}", value_index + 1), value.clone()));
        }
    }
    Ok(params)
}

fn create_tags_params(resource_id: &str, tags: &TagMap) -> Params {
    let mut params = vec![("ResourceId.1".to_string(), resource_id.to_string())];
    for (index, (key, value)) in tags.iter().enumerate() {
        let n = index + 1;
        params.push((format!("Tag.{n}.Key"), key.clone()));
        params.push((format!("Tag.{n}.Value"), value.clone()));
    }
    params
}

fn parse_document(text: &str) -> Result<Document<'_>, GatewayError> {
    Document::parse(text).map_err(|err| GatewayError::Malformed(format!("invalid XML: {err}")))
}

fn child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|candidate| candidate.is_element() && candidate.tag_name().name() == name)
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    raw_text(node, name).map(str::trim)
}

/// Element text exactly as sent. Tag keys and values may carry significant
/// surrounding whitespace.
fn raw_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child(node, name).and_then(|element| element.text())
}

fn tag_pair(item: Node<'_, '_>) -> Option<(String, String)> {
    let key = raw_text(item, "key")?;
    let value = raw_text(item, "value").unwrap_or_default();
    Some((key.to_string(), value.to_string()))
}

/// `<item>` children of the `set` element under `node`.
fn items<'a, 'input: 'a>(
    node: Node<'a, 'input>,
    set: &str,
) -> impl Iterator<Item = Node<'a, 'input>> + 'a {
    child(node, set).into_iter().flat_map(|set| {
        set.children()
            .filter(|item| item.is_element() && item.tag_name().name() == "item")
    })
}

fn required_text(node: Node<'_, '_>, name: &str, what: &str) -> Result<String, GatewayError> {
    child_text(node, name)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .ok_or_else(|| GatewayError::Malformed(format!("{what} without {name}")))
}

fn parse_tag_set(node: Node<'_, '_>) -> TagMap {
    items(node, "tagSet").filter_map(tag_pair).collect()
}

fn parse_volumes(doc: &Document<'_>) -> Result<Vec<Volume>, GatewayError> {
    items(doc.root_element(), "volumeSet")
        .map(|item| -> Result<Volume, GatewayError> {
            // Multi-attach volumes report several attachments; the first one is used.
            let attachment = items(item, "attachmentSet").next().map(|attached| Attachment {
                instance_id: child_text(attached, "instanceId").map(str::to_string),
                device: child_text(attached, "device").map(str::to_string),
            });
            Ok(Volume {
                id: required_text(item, "volumeId", "volume")?,
                status: VolumeStatus::parse(child_text(item, "status").unwrap_or_default()),
                size_gib: child_text(item, "size")
                    .and_then(|size| size.parse().ok())
                    .unwrap_or(0),
                attachment,
                tags: parse_tag_set(item),
            })
        })
        .collect()
}

fn parse_instances(doc: &Document<'_>) -> Result<Vec<Instance>, GatewayError> {
    items(doc.root_element(), "reservationSet")
        .flat_map(|reservation| items(reservation, "instancesSet"))
        .map(|item| -> Result<Instance, GatewayError> {
            Ok(Instance {
                id: required_text(item, "instanceId", "instance")?,
                tags: parse_tag_set(item),
            })
        })
        .collect()
}

fn parse_snapshots(doc: &Document<'_>) -> Result<Vec<Snapshot>, GatewayError> {
    items(doc.root_element(), "snapshotSet")
        .map(|item| -> Result<Snapshot, GatewayError> {
            Ok(Snapshot {
                id: required_text(item, "snapshotId", "snapshot")?,
                volume_id: child_text(item, "volumeId").unwrap_or_default().to_string(),
                tags: parse_tag_set(item),
            })
        })
        .collect()
}

fn parse_tag_descriptions(doc: &Document<'_>) -> Result<Vec<(String, String)>, GatewayError> {
    Ok(items(doc.root_element(), "tagSet")
        .filter_map(tag_pair)
        .collect())
}

/// Turn an error response into a [`GatewayError::Service`].
///
/// EC2 answers `<Response><Errors><Error><Code/><Message/>`; bodies that do
/// not parse keep the HTTP status so classification still works.
fn parse_error(status: u16, body: &str) -> GatewayError {
    let parsed = Document::parse(body).ok().and_then(|doc| {
        let error = doc
            .descendants()
            .find(|node| node.is_element() && node.tag_name().name() == "Error")?;
        let code = child_text(error, "Code")?.to_string();
        let message = child_text(error, "Message").unwrap_or_default().to_string();
        Some((code, message))
    });
    let (code, message) = parsed.unwrap_or_else(|| {
        let snippet: String = body.chars().take(200).collect();
        (format!("Http{status}"), snippet)
    });
    GatewayError::Service {
        status,
        code,
        message,
    }
}
