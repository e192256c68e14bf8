//! Blocked services.
//!
//! Each service is a named bundle of network rules. Catalog rules may use the
//! `.TLD` placeholder, which stands for any top-level label optionally followed
//! by one more short label (`.com`, `.de`, `.co.uk`).

use once_cell::sync::Lazy;
use tracing::{info, warn};

use crate::rule::{pattern_to_regex, Rule};
use crate::{FilterResult, Reason};

const TLD_PLACEHOLDER: &str = ".TLD";
const TLD_REGEX: &str = r"\.[a-z0-9-]+(?:\.[a-z]{2,3})?";
const SENTINEL: char = '\u{0}';

/// Built-in service definitions, in display order.
const SERVICES: &[(&str, &[&str])] = &[
    ("whatsapp", &["||whatsapp.TLD^"]),
    (
        "facebook",
        &[
            "||facebook.TLD^",
            "||fbcdn.TLD^",
            "||accountkit.TLD^",
            "||fb.TLD^",
            "||fbsbx.TLD^",
            "||discoverapp.TLD^",
            "||freebasics.TLD^",
            "||freebasic.TLD^",
            "||internet.org^",
            "||messenger.TLD^",
            "||m.me^",
            "||i.org^",
            "||f8.com^",
            "||tfbnw.TLD^",
            "||fburl.TLD^",
            "||hob.bi^",
            "||workplace.TLD^",
            "||oculus.TLD^",
            "||giphy.TLD^",
            "||forecastapp.net^",
            "||facebookblueprint.TLD^",
            "||facebookrecruiting.TLD^",
            "||facebookbrand.TLD^",
            "||facebookcorewwwi.TLD^",
        ],
    ),
    (
        "twitter",
        &[
            "||twitter.TLD^",
            "||twttr.TLD^",
            "||t.co^",
            "||twimg.TLD^",
            "||ads-twitter.TLD^",
        ],
    ),
    (
        "youtube",
        &[
            "||youtube.TLD^",
            "||ytimg.com^",
            "||youtu.TLD^",
            "||googlevideo.TLD^",
            "||youtubei.googleapis.TLD^",
            "||youtube-nocookie.TLD^",
            "||youtube",
        ],
    ),
    (
        "twitch",
        &["||twitch.tv^", "||ttvnw.TLD^", "||jtvnw.TLD^", "||twitchcdn.TLD^"],
    ),
    (
        "netflix",
        &["||nflxext.TLD^", "||netflix.TLD^", "||nflximg.TLD^", "||nflxvideo.TLD^"],
    ),
    (
        "instagram",
        &["||instagram.TLD^", "||cdninstagram.TLD^", "||instagram-brand.TLD^"],
    ),
    (
        "snapchat",
        &[
            "||snapchat.TLD^",
            "||sc-cdn.TLD^",
            "||snap-dev.TLD^",
            "||snapkit.co",
            "||snapads.TLD^",
            "||impala-media-production.s3.amazonaws.TLD^",
        ],
    ),
    ("discord", &["||discordapp.TLD^", "||discord.TLD^"]),
    ("ok", &["||ok.ru^"]),
    ("skype", &["||skype.TLD^", "||skypeassets.TLD^"]),
    (
        "vk",
        &["||vk.com^", "||userapi.TLD^", "||vk-cdn.TLD^", "||vkuservideo.TLD^"],
    ),
    (
        "origin",
        &["||origin.com^", "||signin.ea.com^", "||accounts.ea.com^"],
    ),
    (
        "steam",
        &[
            "||steam.com^",
            "||steampowered.TLD^",
            "||steamcommunity.TLD^",
            "||steamstatic.TLD^",
            "||steamstore-a.akamaihd.net^",
            "||steamcdn-a.akamaihd.net^",
        ],
    ),
    (
        "epic_games",
        &["||epicgames.TLD^", "||easyanticheat.TLD^", "||easy.ac^", "||eac-cdn.TLD^"],
    ),
    (
        "reddit",
        &["||reddit.TLD^", "||redditstatic.TLD^", "||redditmedia.TLD^", "||redd.it^"],
    ),
    ("mail_ru", &["||mail.ru^"]),
    (
        "cloudflare",
        &[
            "||cloudflare.TLD^",
            "||cloudflare-dns.TLD^",
            "||cloudflareinsights.TLD^",
            "||cloudflarestream.TLD^",
            "||cloudflareclient.TLD^",
            "||cloudflare-ipfs.TLD",
            "||cloudflareworkers.TLD^",
            "||cloudflarestatus.TLD^",
            "||cloudflaressl.TLD^",
            "||encryptedsni.TLD^",
            "||workers.dev^",
            "||one.one^",
            "||warp.plus^",
            "||1.1.1.1^",
        ],
    ),
    (
        "amazon",
        &[
            "||amazon.TLD^",
            "||media-amazon.TLD^",
            "||primevideo.TLD^",
            "||amazontrust.TLD^",
            "||images-amazon.TLD^",
            "||amazonvideo.TLD^",
            "||ssl-images-amazon.TLD^",
            "||amazonpay.TLD^",
            "||amazon-adsystem.TLD^",
            "||amazonaws.TLD^",
            "||aboutamazon.TLD^",
            "||awsstatic.TLD^",
            "||comixology.com^",
            "||boxofficemojo.TLD^",
            "||aiv-delivery.TLD^",
            "||jtvnw.TLD^",
            "||goodreads.TLD^",
            "||zappos.TLD^",
            "||alexa.com^",
            "||a2z.TLD^",
            "||aws",
        ],
    ),
    (
        "ebay",
        &[
            "||ebay.TLD^",
            "||ebayimg.TLD^",
            "||ebaystatic.TLD^",
            "||ebaycdn.TLD^",
            "||ebayinc.TLD^",
            "||e-bay.TLD^",
            "||ebaystores.TLD^",
        ],
    ),
    (
        "tiktok",
        &[
            "||tiktok.TLD^",
            "||tiktokcdn.TLD^",
            "||musical.ly^",
            "||snssdk.TLD^",
            "||amemv.TLD^",
            "||toutiao.com^",
            "||ixigua.com^",
            "||pstatp.TLD^",
            "||byteimg.TLD^",
            "||muscdn.TLD^",
            "||bytedance.map.fastly.net^",
            "||douyin.com^",
            "||tiktokv.TLD^",
        ],
    ),
];

static CATALOG: Lazy<ServiceCatalog> = Lazy::new(ServiceCatalog::build);

/// Returns the built-in service catalog.
pub fn catalog() -> &'static ServiceCatalog {
    &CATALOG
}

/// A named bundle of rules.
#[derive(Debug)]
pub struct BlockedService {
    name: &'static str,
    rules: Vec<Rule>,
}

impl BlockedService {
    /// Service name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Compiled rules, in declaration order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    fn first_match(&self, host: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(host))
    }
}

/// All known services.
#[derive(Debug)]
pub struct ServiceCatalog {
    services: Vec<BlockedService>,
}

impl ServiceCatalog {
    fn build() -> Self {
        let services = SERVICES
            .iter()
            .map(|&(name, texts)| BlockedService {
                name,
                rules: texts
                    .iter()
                    .filter_map(|text| match compile_service_rule(text) {
                        Ok(rule) => Some(rule),
                        Err(e) => {
                            warn!(service = name, rule = text, error = %e, "Skipping service rule");
                            None
                        }
                    })
                    .collect(),
            })
            .collect();
        Self { services }
    }

    /// Service names, in catalog order.
    pub fn names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name).collect()
    }

    /// Looks up a service by name.
    pub fn get(&self, name: &str) -> Option<&BlockedService> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Selects services by name, keeping the caller's order.
    ///
    /// Unknown names are logged and skipped.
    pub fn select(&'static self, names: &[String]) -> ServiceSet {
        let services = names
            .iter()
            .filter_map(|name| {
                let service = self.get(name);
                if service.is_none() {
                    info!(service = %name, "Unknown blocked service, skipping");
                }
                service
            })
            .collect();
        ServiceSet { services }
    }
}

/// Compiles a catalog rule, expanding the `.TLD` placeholder.
fn compile_service_rule(text: &str) -> crate::Result<Rule> {
    if !text.contains(TLD_PLACEHOLDER) {
        let mut rules = Rule::parse_line(text, 0)?;
        return Ok(rules.remove(0));
    }

    let marked = text.replace(TLD_PLACEHOLDER, &SENTINEL.to_string());
    let source = pattern_to_regex(&marked)?.replace(SENTINEL, TLD_REGEX);
    Ok(Rule::from_regex(text, source, 0))
}

/// The services enabled for a check.
#[derive(Debug, Clone, Default)]
pub struct ServiceSet {
    services: Vec<&'static BlockedService>,
}

impl ServiceSet {
    /// Returns true if no service is selected.
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Selected service names.
    pub fn names(&self) -> Vec<&'static str> {
        self.services.iter().map(|s| s.name).collect()
    }

    /// Matches a normalized host: first service, then first rule, wins.
    pub fn check(&self, host: &str) -> FilterResult {
        for service in &self.services {
            if let Some(rule) = service.first_match(host) {
                let mut result =
                    FilterResult::with_reason(Reason::FilteredBlockedService).rule(rule.text());
                result.service_name = Some(service.name.to_string());
                return result;
            }
        }
        FilterResult::not_found()
    }
}
