//! Connection-setup credentials handed out with new sessions.
//!
//! STUN-only when no TURN relay is configured; otherwise coturn-style
//! time-limited credentials: username is "expiry:caller", the secret is
//! HMAC-SHA1 over the username, base64-encoded.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use tether_proto::{IceConfig, IceServer};

use crate::config::Config;

type HmacSha1 = Hmac<Sha1>;

pub fn ice_config(config: &Config, caller: &str, now: DateTime<Utc>) -> IceConfig {
    let expires = now.timestamp() + config.turn_ttl_seconds as i64;
    let mut servers: Vec<IceServer> = config
        .stun_servers
        .iter()
        .map(|urls| IceServer::stun(urls.clone()))
        .collect();

    if let (Some(turn_server), Some(secret)) = (&config.turn_server, &config.turn_secret) {
        let username = format!("{expires}:{caller}");
        let credential = turn_credential(secret, &username);
        servers.push(IceServer {
            urls: turn_server.clone(),
            username: Some(username.clone()),
            credential: Some(credential.clone()),
        });
        servers.push(IceServer {
            urls: format!("{turn_server}?transport=tcp"),
            username: Some(username),
            credential: Some(credential),
        });
    }

    IceConfig {
        ice_servers: servers,
        ttl: config.turn_ttl_seconds,
        expires,
    }
}

fn turn_credential(secret: &str, username: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(username.as_bytes());
    STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stun_only_without_turn_config() {
        let config = Config::default();
        let ice = ice_config(&config, "alice", Utc::now());
        assert_eq!(ice.ice_servers.len(), 2);
        assert!(ice.ice_servers.iter().all(|s| s.credential.is_none()));
    }

    #[test]
    fn turn_credentials_are_time_limited_and_deterministic() {
        let config = Config {
            turn_server: Some("turn:turn.example.net:3478".to_string()),
            turn_secret: Some("shared-secret".to_string()),
            turn_ttl_seconds: 3600,
            ..Config::default()
        };
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let ice = ice_config(&config, "alice", now);

        assert_eq!(ice.ice_servers.len(), 4);
        let turn = &ice.ice_servers[2];
        assert_eq!(turn.username.as_deref(), Some("1700003600:alice"));
        assert_eq!(
            turn.credential,
            ice.ice_servers[3].credential,
            "udp and tcp entries share one credential"
        );
        assert_eq!(ice.expires, 1_700_003_600);

        // Same inputs, same credential.
        let again = ice_config(&config, "alice", now);
        assert_eq!(again.ice_servers[2].credential, turn.credential);
    }
}
