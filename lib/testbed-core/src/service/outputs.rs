//! Reusable `-E key=value` setting builders for the APM server and the beats.

use crate::version::VersionVector;

/// An ordered list of `-E` settings.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Settings(Vec<(String, String)>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a setting.
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Returns `true` if `key` is set to exactly `value`.
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.0.iter().any(|(k, v)| k == key && v == value)
    }

    /// Renders the settings as command line arguments: `-E key=value` for each entry.
    pub fn to_args(&self) -> Vec<String> {
        self.0
            .iter()
            .flat_map(|(key, value)| ["-E".to_string(), format!("{}={}", key, value)])
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Where a shipper's Elasticsearch settings point and how it authenticates.
#[derive(Clone, Debug)]
pub struct ElasticsearchOutput<'a> {
    /// Target URLs; never empty.
    pub urls: Vec<String>,

    pub username: Option<&'a str>,
    pub password: Option<&'a str>,

    /// Credentials used when security is on and no explicit ones were given, as `(username, password)`.
    pub secure_defaults: Option<(String, String)>,

    /// CA bundle to trust, when talking TLS.
    pub certificate_authority: Option<&'a str>,
}

impl<'a> ElasticsearchOutput<'a> {
    /// Creates an output towards `urls`, or towards `fallback` when `urls` is empty.
    pub fn new(urls: &[String], fallback: &str) -> Self {
        let urls = if urls.is_empty() {
            vec![fallback.to_string()]
        } else {
            urls.to_vec()
        };

        Self {
            urls,
            username: None,
            password: None,
            secure_defaults: None,
            certificate_authority: None,
        }
    }

    /// Sets explicit credentials.
    pub fn credentials(mut self, username: Option<&'a str>, password: Option<&'a str>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    /// Sets the credentials used under security when no explicit ones are given.
    pub fn secure_defaults(mut self, enabled: bool, username: impl Into<String>) -> Self {
        self.secure_defaults = enabled.then(|| (username.into(), "changeme".to_string()));
        self
    }
}

/// Adds `<prefix>.elasticsearch.*` connection settings.
pub fn add_elasticsearch_output(settings: &mut Settings, prefix: &str, output: &ElasticsearchOutput<'_>) {
    settings.push(format!("{}.elasticsearch.hosts", prefix), json_list(&output.urls));

    let defaults = output.secure_defaults.as_ref();
    let credentials = [
        ("username", output.username, defaults.map(|(user, _)| user.as_str())),
        ("password", output.password, defaults.map(|(_, password)| password.as_str())),
    ];
    for (field, explicit, default) in credentials {
        if let Some(value) = explicit.filter(|value| !value.is_empty()).or(default) {
            settings.push(format!("{}.elasticsearch.{}", prefix, field), value);
        }
    }

    if let Some(ca) = output.certificate_authority {
        settings.push(
            format!("{}.elasticsearch.ssl.certificate_authorities", prefix),
            format!("['{}']", ca),
        );
    }
}

/// Formats `items` as a JSON list of strings, with `", "` separators.
pub fn json_list(items: &[String]) -> String {
    let quoted: Vec<String> = items.iter().map(|item| serde_json::Value::from(item.as_str()).to_string()).collect();
    format!("[{}]", quoted.join(", "))
}

/// Adds the settings that ship events to the `logstash` service.
pub fn add_logstash_output(settings: &mut Settings) {
    settings.push("output.logstash.enabled", "true");
    settings.push("output.logstash.hosts", "[\"logstash:5044\"]");
}

/// Adds the settings that ship events to the `kafka` service, using `topics` as the topic selector.
pub fn add_kafka_output(settings: &mut Settings, topics: &str) {
    settings.push("output.kafka.enabled", "true");
    settings.push("output.kafka.hosts", "[\"kafka:9092\"]");
    settings.push("output.kafka.topics", topics);
}

/// Prefix of the self-monitoring settings, which moved out of `xpack` in 7.2.
pub fn monitoring_prefix(version: &VersionVector) -> &'static str {
    if version.at_least("7.2") {
        "monitoring"
    } else {
        "xpack.monitoring"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elasticsearch_output_with_secure_defaults() {
        let mut settings = Settings::new();
        let output = ElasticsearchOutput::new(&[], "http://elasticsearch:9200")
            .credentials(Some("explicit"), None)
            .secure_defaults(true, "filebeat_user");
        add_elasticsearch_output(&mut settings, "output", &output);

        assert_eq!(
            settings.to_args(),
            [
                "-E",
                "output.elasticsearch.hosts=[\"http://elasticsearch:9200\"]",
                "-E",
                "output.elasticsearch.username=explicit",
                "-E",
                "output.elasticsearch.password=changeme",
            ]
        );
    }

    #[test]
    fn elasticsearch_output_without_security() {
        let mut settings = Settings::new();
        let urls = vec!["http://a:9200".to_string(), "http://b:9200".to_string()];
        add_elasticsearch_output(&mut settings, "monitoring", &ElasticsearchOutput::new(&urls, "unused"));

        assert_eq!(settings.len(), 1);
        assert!(settings.contains(
            "monitoring.elasticsearch.hosts",
            "[\"http://a:9200\", \"http://b:9200\"]"
        ));
    }

    #[test]
    fn monitoring_prefix_moves_at_7_2() {
        assert_eq!(monitoring_prefix(&VersionVector::parse_lenient("7.1.1")), "xpack.monitoring");
        assert_eq!(monitoring_prefix(&VersionVector::parse_lenient("7.2.0")), "monitoring");
    }
}
