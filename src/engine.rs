//! Fallback decision engine and application lifecycle.
//!
//! [`FallbackEngine`] is the pure part: given a request and the primary answer it
//! returns a [`Verdict`] without side effects. [`FallbackApp`] wires the engine to
//! its host: response cache, direct resolution, the fallback client and the
//! GeoIP refresher task.

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::RData;
use log::Level;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{AppConfig, EngineConfig};
use crate::geoip_manager::{load_cached_database, GeoRefresher};
use crate::rule::{CountryLookup, GeoClassifier, GeoDatabase};
use crate::upstream::{HostContext, Resolve, Upstreams};
use crate::verdict::{DomainClass, FallbackReason, QueryClass, Verdict};

/// Name of the first question, or an empty string.
pub fn query_name(request: &Message) -> String {
    request
        .queries()
        .first()
        .map(|q| q.name().to_ascii())
        .unwrap_or_default()
}

/// Addresses carried by A and AAAA records of the answer section, in record order.
pub fn answer_addresses(response: &Message) -> impl Iterator<Item = IpAddr> + '_ {
    response.answers().iter().filter_map(|record| match record.data() {
        Some(RData::A(a)) => Some(IpAddr::V4(a.0)),
        Some(RData::AAAA(aaaa)) => Some(IpAddr::V6(aaaa.0)),
        _ => None,
    })
}

/// Build an error response echoing the request's questions.
pub fn error_response(request: &Message, rcode: ResponseCode) -> Message {
    let mut msg = Message::new();
    msg.set_id(request.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(request.recursion_desired());
    msg.set_recursion_available(true);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);
    msg.add_queries(request.queries().to_vec());
    msg
}

/// Classifies primary answers against domain, IP range and GeoIP rules.
#[derive(Debug)]
pub struct FallbackEngine {
    config: EngineConfig,
    geo: Arc<GeoClassifier>,
    trace: Level,
}

impl FallbackEngine {
    /// Create an engine over compiled configuration and a shared classifier.
    pub fn new(config: EngineConfig, geo: Arc<GeoClassifier>) -> Self {
        let trace = if config.debug { Level::Info } else { Level::Debug };
        Self { config, geo, trace }
    }

    /// An engine that accepts every answer.
    pub fn passthrough() -> Self {
        Self::new(EngineConfig::default(), Arc::new(GeoClassifier::new()))
    }

    /// The compiled configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The shared GeoIP classifier.
    pub fn geo(&self) -> &Arc<GeoClassifier> {
        &self.geo
    }

    /// Whether any fallback name server is configured.
    pub fn has_fallback(&self) -> bool {
        !self.config.upstreams.is_empty()
    }

    /// Pre-resolution classification of a query name.
    pub fn classify(&self, name: &str) -> QueryClass {
        if self.config.except_domains.matches(name) {
            return QueryClass::Exempt;
        }
        match self.config.domains.classify(name) {
            DomainClass::Bypass => QueryClass::Bypass,
            DomainClass::Normal => QueryClass::Normal,
        }
    }

    /// Decide whether the primary answer can be trusted.
    ///
    /// `first_pass` is `None` when the primary path produced no answer at all.
    pub fn decide(&self, request: &Message, first_pass: Option<&Message>) -> Verdict {
        if !self.has_fallback() {
            return Verdict::Accept;
        }

        let name = query_name(request);
        if self.config.except_domains.matches(&name) {
            log::log!(self.trace, "Except domain({}), accept", name);
            return Verdict::Accept;
        }
        if let Some(rule) = self.config.domains.find(&name) {
            log::log!(self.trace, "Match domain({}) for {}, fallback", rule, name);
            return Verdict::Fallback(FallbackReason::DomainRule(rule.to_string()));
        }

        match first_pass {
            Some(response) => self.inspect(response),
            None => Verdict::Fallback(FallbackReason::NoAnswer),
        }
    }

    /// Check the primary response itself, ignoring domain rules.
    pub fn inspect(&self, response: &Message) -> Verdict {
        let rcode = response.response_code();
        if rcode != ResponseCode::NoError {
            return Verdict::Fallback(FallbackReason::ErrorCode(rcode));
        }
        if response.answers().is_empty() {
            return Verdict::Fallback(FallbackReason::EmptyAnswer);
        }

        // One snapshot per answer: a concurrent publish never splits a decision.
        let snapshot = self.geo.snapshot();
        for ip in answer_addresses(response) {
            if let Some(reason) = self.check_address(ip, snapshot.as_deref()) {
                log::log!(self.trace, "Fallback: {}", reason);
                return Verdict::Fallback(reason);
            }
        }
        Verdict::Accept
    }

    /// Returns a reason if this address marks the answer as contaminated.
    fn check_address(&self, ip: IpAddr, geo: Option<&GeoDatabase>) -> Option<FallbackReason> {
        if self.config.ranges.contains_ip(ip) {
            return Some(FallbackReason::IpRange(ip));
        }

        let policy = &self.config.geo;
        if !policy.is_active() {
            return None;
        }
        let lookup = geo.map_or(CountryLookup::NotFound, |db| db.lookup_country(ip));
        if policy.accepts(&lookup) {
            log::log!(self.trace, "Match country({}:{})", ip, lookup);
            return None;
        }
        Some(match lookup {
            CountryLookup::Found(country) => FallbackReason::Country { ip, country },
            CountryLookup::NotFound => FallbackReason::UnknownCountry(ip),
        })
    }
}

/// The engine bound to a host: the entry point a DNS server calls per request.
///
/// Construction never fails. A configuration that cannot be parsed, or one
/// without any usable name server, yields a passthrough app that only forwards
/// to the host's direct resolution path.
pub struct FallbackApp {
    engine: FallbackEngine,
    host: HostContext,
    fallback: Option<Arc<dyn Resolve>>,
    shutdown: watch::Sender<bool>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl FallbackApp {
    /// Parse `config` and initialize the app.
    ///
    /// Must be called inside a tokio runtime for the GeoIP refresher to start.
    pub fn initialize(host: HostContext, config: &str) -> Self {
        match AppConfig::from_json(config) {
            Ok(cfg) => Self::with_config(host, &cfg),
            Err(e) => {
                log::error!("Read config failed, running as passthrough: {}", e);
                Self::build(host, FallbackEngine::passthrough(), None)
            }
        }
    }

    /// Initialize from an already parsed configuration.
    pub fn with_config(host: HostContext, cfg: &AppConfig) -> Self {
        let mut config = cfg.compile();
        let classifier = Arc::new(GeoClassifier::new());

        if config.geo.enabled {
            load_cached_database(&host.app_folder, &classifier);
        }

        let fallback = Self::connect(&host, &config.upstreams);
        if fallback.is_none() {
            config.upstreams = Upstreams::default();
        }

        let subscribe_url = config
            .geo
            .subscribe_url
            .clone()
            .filter(|_| config.geo.enabled);
        let app = Self::build(host, FallbackEngine::new(config, classifier.clone()), fallback);

        if let Some(url) = subscribe_url {
            app.start_refresher(GeoRefresher::new(&url, &app.host.app_folder, classifier));
        }
        app
    }

    fn build(
        host: HostContext,
        engine: FallbackEngine,
        fallback: Option<Arc<dyn Resolve>>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            host,
            fallback,
            shutdown,
            refresher: Mutex::new(None),
        }
    }

    fn connect(host: &HostContext, upstreams: &Upstreams) -> Option<Arc<dyn Resolve>> {
        if upstreams.is_empty() {
            return None;
        }
        match host.connector.connect(upstreams) {
            Ok(client) => {
                for server in &upstreams.servers {
                    log::debug!("Fallback name server: {}", server);
                }
                if let Some(proxy) = &upstreams.proxy {
                    log::info!("Proxy configured: {:?} {}:{}", proxy.proxy_type, proxy.address, proxy.port);
                }
                log::info!("Name servers configured: {}", upstreams.servers.len());
                Some(client)
            }
            Err(e) => {
                log::error!("Create fallback client failed: {}", e);
                None
            }
        }
    }

    fn start_refresher(&self, refresher: GeoRefresher) {
        if tokio::runtime::Handle::try_current().is_err() {
            log::warn!("No tokio runtime, GeoIP refresher not started");
            return;
        }
        let task = refresher.spawn(self.shutdown.subscribe());
        *self.refresher.lock() = Some(task);
    }

    /// The decision engine.
    pub fn engine(&self) -> &FallbackEngine {
        &self.engine
    }

    /// Whether the app only forwards to the direct path.
    pub fn is_passthrough(&self) -> bool {
        self.fallback.is_none()
    }

    /// Whether the GeoIP refresher task is running.
    pub fn is_refreshing(&self) -> bool {
        self.refresher
            .lock()
            .as_ref()
            .map_or(false, |task| !task.is_finished())
    }

    /// Pre-resolution classification of a query name.
    pub fn classify(&self, name: &str) -> QueryClass {
        self.engine.classify(name)
    }

    /// Post-resolution decision on a primary answer.
    pub fn decide(&self, request: &Message, first_pass: Option<&Message>) -> Verdict {
        self.engine.decide(request, first_pass)
    }

    /// Answer a request, re-resolving through the fallback servers when needed.
    ///
    /// Never fails: the worst outcome is the unmodified primary answer, or a
    /// SERVFAIL when nothing could be resolved at all.
    pub async fn process_request(&self, request: &Message) -> Message {
        let name = query_name(request);
        log::log!(self.engine.trace, "Incoming request({})", name);

        if let Some(cached) = self.host.cache.query(request) {
            log::log!(self.engine.trace, "Return cache result({})", name);
            return cached;
        }

        if self.fallback.is_none() {
            return self.direct_or_servfail(request).await;
        }

        match self.engine.classify(&name) {
            QueryClass::Exempt => {
                let answer = self.direct_or_servfail(request).await;
                self.cache_if_ok(&answer);
                return answer;
            }
            QueryClass::Bypass => {
                log::log!(self.engine.trace, "Bypass primary path({})", name);
                return self.resolve_fallback(request, None).await;
            }
            QueryClass::Normal => {}
        }

        let first_pass = match self.host.direct.resolve(request).await {
            Ok(answer) => Some(answer),
            Err(e) => {
                log::debug!("Primary resolution failed({}): {}", name, e);
                None
            }
        };

        match self.engine.decide(request, first_pass.as_ref()) {
            Verdict::Accept => match first_pass {
                Some(answer) => {
                    self.cache_if_ok(&answer);
                    answer
                }
                None => error_response(request, ResponseCode::ServFail),
            },
            Verdict::Fallback(reason) => {
                log::log!(self.engine.trace, "Fallback, resolve again({}): {}", name, reason);
                self.fallback_or(request, first_pass, true).await
            }
        }
    }

    /// Resolve through the fallback servers.
    ///
    /// On failure returns `first_pass` if there is one, otherwise makes one
    /// best-effort direct query.
    pub async fn resolve_fallback(&self, request: &Message, first_pass: Option<Message>) -> Message {
        self.fallback_or(request, first_pass, false).await
    }

    /// Fallback resolution; `direct_tried` suppresses the best-effort direct
    /// query when the primary path already failed for this request.
    async fn fallback_or(
        &self,
        request: &Message,
        first_pass: Option<Message>,
        direct_tried: bool,
    ) -> Message {
        let result = match &self.fallback {
            Some(client) => client.resolve(request).await,
            None => Err(crate::Error::Resolve("no fallback name servers".to_string())),
        };

        match result {
            Ok(answer) => {
                self.cache_if_ok(&answer);
                answer
            }
            Err(e) => {
                log::warn!("Fallback resolution failed({}): {}", query_name(request), e);
                match first_pass {
                    Some(answer) => answer,
                    None if direct_tried => error_response(request, ResponseCode::ServFail),
                    None => self.direct_or_servfail(request).await,
                }
            }
        }
    }

    async fn direct_or_servfail(&self, request: &Message) -> Message {
        match self.host.direct.resolve(request).await {
            Ok(answer) => answer,
            Err(e) => {
                log::warn!("Direct resolution failed({}): {}", query_name(request), e);
                error_response(request, ResponseCode::ServFail)
            }
        }
    }

    fn cache_if_ok(&self, answer: &Message) {
        if answer.response_code() == ResponseCode::NoError {
            self.host.cache.cache_response(answer);
        }
    }

    /// Signal the GeoIP refresher to stop. Idempotent.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Signal the refresher and wait for it to exit.
    pub async fn stop(&self) {
        self.shutdown();
        let task = self.refresher.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::warn!("GeoIP refresher ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for FallbackApp {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::rule::geoip::tests::StaticCountries;
    use crate::rule::CountryDatabase;
    use hickory_proto::op::Query;
    use hickory_proto::rr::rdata::{A, AAAA, CNAME};
    use hickory_proto::rr::{Name, Record, RecordType};
    use std::str::FromStr;

    fn request(name: &str) -> Message {
        let mut msg = Message::new();
        msg.set_id(4242);
        msg.set_recursion_desired(true);
        msg.add_query(Query::query(Name::from_str(name).unwrap(), RecordType::A));
        msg
    }

    fn answer(req: &Message, ips: &[&str]) -> Message {
        let mut msg = error_response(req, ResponseCode::NoError);
        let name = req.queries()[0].name().clone();
        for ip in ips {
            let rdata = match ip.parse::<IpAddr>().unwrap() {
                IpAddr::V4(v4) => RData::A(A(v4)),
                IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
            };
            msg.add_answer(Record::from_rdata(name.clone(), 300, rdata));
        }
        msg
    }

    fn engine(json: &str, countries: &[(&str, &'static str)]) -> FallbackEngine {
        let config = AppConfig::from_json(json).unwrap().compile();
        let geo = GeoClassifier::new();
        if !countries.is_empty() {
            geo.publish(GeoDatabase::new(StaticCountries::of(countries), "test"));
        }
        FallbackEngine::new(config, Arc::new(geo))
    }

    const NS: &str = r#""nameServers": [{"ip": "8.8.8.8", "protocol": "Udp"}]"#;

    #[test]
    fn test_no_name_servers_is_passthrough() {
        let e = engine(r#"{"domains": ["+.bad.com"], "ipcidr": ["0.0.0.0/0"]}"#, &[]);
        let req = request("www.bad.com");

        assert!(!e.has_fallback());
        assert_eq!(e.decide(&req, None), Verdict::Accept);
        assert_eq!(e.decide(&req, Some(&answer(&req, &["1.2.3.4"]))), Verdict::Accept);
    }

    #[test]
    fn test_except_domain_accepts_unexamined() {
        let e = engine(
            &format!(
                r#"{{"domains": ["+.corp.lan"], "exceptDomains": ["+.corp.lan"], "ipcidr": ["10.0.0.0/8"], {}}}"#,
                NS
            ),
            &[],
        );
        let req = request("git.corp.lan");

        assert_eq!(e.classify("git.corp.lan"), QueryClass::Exempt);
        assert_eq!(e.decide(&req, Some(&answer(&req, &["10.1.1.1"]))), Verdict::Accept);
        assert_eq!(e.decide(&req, None), Verdict::Accept);
    }

    #[test]
    fn test_domain_rule_bypasses_inspection() {
        let e = engine(&format!(r#"{{"domains": ["*.badcdn.com"], {}}}"#, NS), &[]);
        let req = request("x.badcdn.com.");

        assert_eq!(e.classify("x.badcdn.com."), QueryClass::Bypass);
        assert_eq!(
            e.decide(&req, Some(&answer(&req, &["1.2.3.4"]))),
            Verdict::Fallback(FallbackReason::DomainRule("*.badcdn.com".to_string()))
        );
        assert_eq!(e.classify("other.com"), QueryClass::Normal);
    }

    #[test]
    fn test_missing_error_or_empty_answer() {
        let e = engine(&format!("{{{}}}", NS), &[]);
        let req = request("example.com");

        assert_eq!(e.decide(&req, None), Verdict::Fallback(FallbackReason::NoAnswer));
        assert_eq!(
            e.decide(&req, Some(&error_response(&req, ResponseCode::ServFail))),
            Verdict::Fallback(FallbackReason::ErrorCode(ResponseCode::ServFail))
        );
        assert_eq!(
            e.decide(&req, Some(&answer(&req, &[]))),
            Verdict::Fallback(FallbackReason::EmptyAnswer)
        );
    }

    #[test]
    fn test_one_contaminated_record_triggers_fallback() {
        let e = engine(&format!(r#"{{"ipcidr": ["198.18.0.0/15"], {}}}"#, NS), &[]);
        let req = request("example.com");

        let resp = answer(&req, &["93.184.216.34", "198.19.0.1", "93.184.216.35"]);
        assert_eq!(
            e.decide(&req, Some(&resp)),
            Verdict::Fallback(FallbackReason::IpRange("198.19.0.1".parse().unwrap()))
        );

        let clean = answer(&req, &["93.184.216.34"]);
        assert_eq!(e.decide(&req, Some(&clean)), Verdict::Accept);
    }

    #[test]
    fn test_geo_rejects_foreign_and_unknown() {
        let e = engine(
            &format!(r#"{{"geo": {{"isEnabled": true, "countries": ["CN"]}}, {}}}"#, NS),
            &[("1.1.1.1", "CN"), ("2.2.2.2", "US")],
        );
        let req = request("example.com");

        assert_eq!(e.decide(&req, Some(&answer(&req, &["1.1.1.1"]))), Verdict::Accept);
        assert_eq!(
            e.decide(&req, Some(&answer(&req, &["1.1.1.1", "2.2.2.2"]))),
            Verdict::Fallback(FallbackReason::Country {
                ip: "2.2.2.2".parse().unwrap(),
                country: "US".to_string()
            })
        );
        assert_eq!(
            e.decide(&req, Some(&answer(&req, &["3.3.3.3"]))),
            Verdict::Fallback(FallbackReason::UnknownCountry("3.3.3.3".parse().unwrap()))
        );
    }

    /// Publishes its replacement into the classifier on the first lookup.
    struct SwapOnLookup {
        classifier: Arc<GeoClassifier>,
        next: Mutex<Option<GeoDatabase>>,
        countries: StaticCountries,
    }

    impl CountryDatabase for SwapOnLookup {
        fn country(&self, ip: IpAddr) -> Option<String> {
            if let Some(db) = self.next.lock().take() {
                self.classifier.publish(db);
            }
            self.countries.country(ip)
        }
    }

    #[test]
    fn test_publish_during_decide_uses_one_snapshot() {
        let config = AppConfig::from_json(&format!(
            r#"{{"geo": {{"isEnabled": true, "countries": ["CN"]}}, {}}}"#,
            NS
        ))
        .unwrap()
        .compile();
        let classifier = Arc::new(GeoClassifier::new());
        let replacement = GeoDatabase::new(
            StaticCountries::of(&[("1.1.1.1", "US"), ("2.2.2.2", "CN")]),
            "new",
        );
        classifier.publish(GeoDatabase::new(
            SwapOnLookup {
                classifier: classifier.clone(),
                next: Mutex::new(Some(replacement)),
                countries: StaticCountries::of(&[("1.1.1.1", "CN"), ("2.2.2.2", "US")]),
            },
            "old",
        ));
        let e = FallbackEngine::new(config, classifier.clone());
        let req = request("example.com");
        let resp = answer(&req, &["1.1.1.1", "2.2.2.2"]);

        // Whole answer judged against the old table, even though it was replaced mid-way
        assert_eq!(
            e.decide(&req, Some(&resp)),
            Verdict::Fallback(FallbackReason::Country {
                ip: "2.2.2.2".parse().unwrap(),
                country: "US".to_string()
            })
        );
        assert_eq!(classifier.snapshot().unwrap().source(), "new");

        // Next decision sees only the new table
        assert_eq!(
            e.decide(&req, Some(&resp)),
            Verdict::Fallback(FallbackReason::Country {
                ip: "1.1.1.1".parse().unwrap(),
                country: "US".to_string()
            })
        );
    }

    #[test]
    fn test_geo_without_database_fails_closed() {
        let e = engine(
            &format!(r#"{{"geo": {{"isEnabled": true, "countries": ["CN"]}}, {}}}"#, NS),
            &[],
        );
        let req = request("example.com");
        assert!(e.decide(&req, Some(&answer(&req, &["1.1.1.1"]))).is_fallback());
    }

    #[test]
    fn test_geo_disabled_or_empty_countries_skips_lookup() {
        let req = request("example.com");

        let disabled = engine(
            &format!(r#"{{"geo": {{"isEnabled": false, "countries": ["CN"]}}, {}}}"#, NS),
            &[],
        );
        assert_eq!(disabled.decide(&req, Some(&answer(&req, &["2.2.2.2"]))), Verdict::Accept);

        let no_countries = engine(&format!(r#"{{"geo": {{"isEnabled": true}}, {}}}"#, NS), &[]);
        assert_eq!(
            no_countries.decide(&req, Some(&answer(&req, &["2.2.2.2"]))),
            Verdict::Accept
        );
    }

    #[test]
    fn test_ipv6_geo_checked_but_not_range_checked() {
        let e = engine(
            &format!(
                r#"{{"ipcidr": ["0.0.0.0/0"], "geo": {{"isEnabled": true, "countries": ["JP"]}}, {}}}"#,
                NS
            ),
            &[("2001:db8::1", "JP"), ("2001:db8::2", "KR")],
        );
        let req = request("example.com");

        assert_eq!(e.decide(&req, Some(&answer(&req, &["2001:db8::1"]))), Verdict::Accept);
        assert!(e.decide(&req, Some(&answer(&req, &["2001:db8::2"]))).is_fallback());
    }

    #[test]
    fn test_non_address_records_ignored() {
        let e = engine(&format!(r#"{{"ipcidr": ["0.0.0.0/0"], {}}}"#, NS), &[]);
        let req = request("www.example.com");

        let mut resp = answer(&req, &[]);
        resp.add_answer(Record::from_rdata(
            Name::from_str("www.example.com").unwrap(),
            300,
            RData::CNAME(CNAME(Name::from_str("example.net").unwrap())),
        ));
        assert_eq!(e.decide(&req, Some(&resp)), Verdict::Accept);
    }

    #[test]
    fn test_decide_is_repeatable() {
        let e = engine(
            &format!(
                r#"{{"ipcidr": ["10.0.0.0/8"], "geo": {{"isEnabled": true, "countries": ["DE"]}}, {}}}"#,
                NS
            ),
            &[("5.5.5.5", "DE"), ("5.5.5.6", "DE")],
        );
        let req = request("example.de");
        let resp = answer(&req, &["5.5.5.5", "5.5.5.6"]);

        for _ in 0..100 {
            assert_eq!(e.decide(&req, Some(&resp)), Verdict::Accept);
        }
    }

    #[test]
    fn test_answer_addresses_order() {
        let req = request("example.com");
        let resp = answer(&req, &["1.1.1.1", "::1", "2.2.2.2"]);
        let ips: Vec<String> = answer_addresses(&resp).map(|ip| ip.to_string()).collect();
        assert_eq!(ips, vec!["1.1.1.1", "::1", "2.2.2.2"]);
    }

    #[test]
    fn test_error_response_echoes_question() {
        let req = request("example.com");
        let resp = error_response(&req, ResponseCode::ServFail);
        assert_eq!(resp.id(), 4242);
        assert_eq!(resp.message_type(), MessageType::Response);
        assert_eq!(resp.response_code(), ResponseCode::ServFail);
        assert_eq!(resp.queries(), req.queries());
        assert_eq!(query_name(&resp), "example.com");
    }
}
