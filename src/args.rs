use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{TileServerError, TileServerResult};

#[derive(Parser, Debug, PartialEq)]
#[command(
    name = "maps-tiles",
    about = "Clustered map-tile rendering and serving pipeline",
    version
)]
pub struct Args {
    /// Listen address as <host>:<port>; the host doubles as the address
    /// advertised to cluster peers.
    pub listen: String,

    /// Port for peer-originated requests. Defaults to the public port plus
    /// one.
    #[arg(long)]
    pub internal_port: Option<u16>,

    /// Bind address for both listeners, when it differs from the advertised
    /// host.
    #[arg(long)]
    pub bind_addr: Option<String>,

    #[command(subcommand)]
    pub config: ConfigSource,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum ConfigSource {
    /// Read configuration once from a JSON file.
    Json { path: PathBuf },
    /// Watch configuration in an etcd cluster.
    Etcd { host: String },
}

impl Args {
    pub fn host_port(&self) -> TileServerResult<(String, u16)> {
        let (host, port) = self
            .listen
            .rsplit_once(':')
            .ok_or_else(|| TileServerError::AddressError(self.listen.clone()))?;
        let port: u16 = port
            .parse()
            .map_err(|_| TileServerError::AddressError(self.listen.clone()))?;
        if host.is_empty() {
            return Err(TileServerError::AddressError(self.listen.clone()));
        }
        Ok((host.to_string(), port))
    }

    pub fn internal_port(&self, public_port: u16) -> u16 {
        self.internal_port.unwrap_or(public_port.wrapping_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_form() {
        let args =
            Args::parse_from(["maps-tiles", "0.0.0.0:8080", "json", "/etc/maps/config.json"]);
        assert_eq!(args.host_port().unwrap(), ("0.0.0.0".to_string(), 8080));
        assert_eq!(args.internal_port(8080), 8081);
        assert_eq!(
            args.config,
            ConfigSource::Json {
                path: PathBuf::from("/etc/maps/config.json")
            }
        );
    }

    #[test]
    fn parses_etcd_form_with_overrides() {
        let args = Args::parse_from([
            "maps-tiles",
            "tiles01:9000",
            "--internal-port",
            "9100",
            "--bind-addr",
            "0.0.0.0",
            "etcd",
            "etcd.local",
        ]);
        assert_eq!(args.host_port().unwrap(), ("tiles01".to_string(), 9000));
        assert_eq!(args.internal_port(9000), 9100);
        assert_eq!(args.bind_addr.as_deref(), Some("0.0.0.0"));
        assert_eq!(
            args.config,
            ConfigSource::Etcd {
                host: "etcd.local".to_string()
            }
        );
    }

    #[test]
    fn rejects_bad_listen_address() {
        let args = Args::parse_from(["maps-tiles", "no-port", "json", "x.json"]);
        assert!(args.host_port().is_err());
    }
}
