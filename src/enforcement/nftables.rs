//! nftables backend
//!
//! Maintains an `inet` table with one set per address family and an input
//! chain dropping traffic from either set. Bans are plain set elements:
//! expiry is driven by the daemon, not by nftables timeouts, so the ban
//! store stays authoritative.

use async_trait::async_trait;
use nftables::{
    batch::Batch,
    expr::{Expression, NamedExpression, Payload, PayloadField},
    helper::{apply_ruleset, get_current_ruleset, NftablesError},
    schema::{
        Chain, Element, NfCmd, NfListObject, NfObject, Nftables, Rule, Set, SetType,
        SetTypeValue, Table,
    },
    stmt::{Match, Operator, Statement},
    types::{NfChainPolicy, NfChainType, NfFamily, NfHook},
};
use std::borrow::Cow;
use std::net::IpAddr;
use tracing::{debug, info};

use super::{EnforcementBackend, EnforcementError};
use crate::config::NftablesConfig;

pub struct NftablesBackend {
    config: NftablesConfig,
}

impl NftablesBackend {
    pub fn new(config: NftablesConfig) -> Self {
        Self { config }
    }
}

fn set_for<'c>(config: &'c NftablesConfig, ip: &IpAddr) -> &'c str {
    match ip {
        IpAddr::V4(_) => &config.set_v4,
        IpAddr::V6(_) => &config.set_v6,
    }
}

/// Table, sets, chain and drop rules
fn add_init_objects(config: &NftablesConfig, batch: &mut Batch) {
    let table = config.table_name.clone();

    batch.add(NfListObject::Table(Table {
        family: NfFamily::INet,
        name: Cow::Owned(table.clone()),
        handle: None,
    }));

    for (name, set_type, comment) in [
        (&config.set_v4, SetType::Ipv4Addr, "banwarden blocked IPv4 addresses"),
        (&config.set_v6, SetType::Ipv6Addr, "banwarden blocked IPv6 addresses"),
    ] {
        batch.add(NfListObject::Set(Box::new(Set {
            family: NfFamily::INet,
            table: Cow::Owned(table.clone()),
            name: Cow::Owned(name.clone()),
            handle: None,
            set_type: SetTypeValue::Single(set_type),
            policy: None,
            flags: None,
            elem: None,
            timeout: None,
            gc_interval: None,
            size: None,
            comment: Some(Cow::Borrowed(comment)),
        })));
    }

    batch.add(NfListObject::Chain(Chain {
        family: NfFamily::INet,
        table: Cow::Owned(table.clone()),
        name: Cow::Owned(config.chain_name.clone()),
        newname: None,
        handle: None,
        _type: Some(NfChainType::Filter),
        hook: Some(NfHook::Input),
        prio: Some(config.priority),
        dev: None,
        policy: Some(NfChainPolicy::Accept),
    }));

    for (protocol, set, comment) in [
        ("ip", &config.set_v4, "Drop banned IPv4"),
        ("ip6", &config.set_v6, "Drop banned IPv6"),
    ] {
        batch.add(NfListObject::Rule(Rule {
            family: NfFamily::INet,
            table: Cow::Owned(table.clone()),
            chain: Cow::Owned(config.chain_name.clone()),
            handle: None,
            index: None,
            comment: Some(Cow::Borrowed(comment)),
            expr: Cow::Owned(vec![
                Statement::Match(Match {
                    left: Expression::Named(NamedExpression::Payload(Payload::PayloadField(
                        PayloadField {
                            protocol: Cow::Borrowed(protocol),
                            field: Cow::Borrowed("saddr"),
                        },
                    ))),
                    right: Expression::String(Cow::Owned(format!("@{}", set))),
                    op: Operator::IN,
                }),
                Statement::Drop(None),
            ]),
        }));
    }
}

/// Add or delete one set element
fn apply_element(config: &NftablesConfig, ip: &IpAddr, add: bool) -> Result<(), NftablesError> {
    let element = NfListObject::Element(Element {
        family: NfFamily::INet,
        table: Cow::Owned(config.table_name.clone()),
        name: Cow::Owned(set_for(config, ip).to_string()),
        elem: Cow::Owned(vec![Expression::String(Cow::Owned(ip.to_string()))]),
    });

    let mut batch = Batch::new();
    batch.add_cmd(if add {
        NfCmd::Add(element)
    } else {
        NfCmd::Delete(element)
    });
    apply_ruleset(&batch.to_nftables())
}

fn table_exists(ruleset: &Nftables, table_name: &str) -> bool {
    ruleset.objects.iter().any(|obj| {
        matches!(
            obj,
            NfObject::ListObject(NfListObject::Table(table))
                if table.name == table_name && table.family == NfFamily::INet
        )
    })
}

/// Addresses in our two sets
fn set_elements(ruleset: &Nftables, config: &NftablesConfig) -> Vec<IpAddr> {
    let mut ips = Vec::new();

    for obj in ruleset.objects.iter() {
        if let NfObject::ListObject(NfListObject::Set(set)) = obj {
            if set.table != config.table_name
                || (set.name != config.set_v4 && set.name != config.set_v6)
            {
                continue;
            }
            if let Some(elems) = &set.elem {
                for elem in elems.iter() {
                    let text = match elem {
                        Expression::String(ip) => Some(ip.as_ref()),
                        Expression::Named(NamedExpression::Elem(e)) => match e.val.as_ref() {
                            Expression::String(ip) => Some(ip.as_ref()),
                            _ => None,
                        },
                        _ => None,
                    };
                    if let Some(ip) = text.and_then(|t| t.parse().ok()) {
                        ips.push(ip);
                    }
                }
            }
        }
    }

    ips
}

/// nft runs synchronously; keep it off the async workers
async fn blocking<T, F>(f: F) -> Result<T, EnforcementError>
where
    F: FnOnce() -> Result<T, EnforcementError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EnforcementError::Unreachable(format!("nft task failed: {}", e)))?
}

fn classify(ip: Option<IpAddr>, err: NftablesError) -> EnforcementError {
    match (&err, ip) {
        (NftablesError::NftExecution { .. }, _) | (_, None) => {
            EnforcementError::Unreachable(err.to_string())
        }
        (_, Some(ip)) => EnforcementError::Rejected {
            ip,
            reason: format!("{:?}", err),
        },
    }
}

/// Deleting an element that is not in the set fails with ENOENT
fn is_missing_element(err: &NftablesError) -> bool {
    let detail = format!("{:?}", err);
    detail.contains("No such file or directory") || detail.contains("does not exist")
}

#[async_trait]
impl EnforcementBackend for NftablesBackend {
    fn name(&self) -> &str {
        "nftables"
    }

    async fn init(&self) -> Result<(), EnforcementError> {
        let config = self.config.clone();

        blocking(move || {
            let ruleset = get_current_ruleset().map_err(|e| classify(None, e))?;
            if table_exists(&ruleset, &config.table_name) {
                debug!("Table {} already exists", config.table_name);
                return Ok(());
            }

            let mut batch = Batch::new();
            add_init_objects(&config, &mut batch);
            apply_ruleset(&batch.to_nftables()).map_err(|e| classify(None, e))?;

            info!("nftables table {} initialized", config.table_name);
            Ok(())
        })
        .await
    }

    async fn install(&self, ip: IpAddr) -> Result<(), EnforcementError> {
        let config = self.config.clone();
        blocking(move || {
            apply_element(&config, &ip, true).map_err(|e| classify(Some(ip), e))?;
            debug!("Added {} to {}", ip, set_for(&config, &ip));
            Ok(())
        })
        .await
    }

    async fn remove(&self, ip: IpAddr) -> Result<(), EnforcementError> {
        let config = self.config.clone();
        blocking(move || match apply_element(&config, &ip, false) {
            Ok(()) => {
                debug!("Removed {} from {}", ip, set_for(&config, &ip));
                Ok(())
            }
            Err(e) if is_missing_element(&e) => {
                debug!("{} was not in {}", ip, set_for(&config, &ip));
                Ok(())
            }
            Err(e) => Err(classify(Some(ip), e)),
        })
        .await
    }

    async fn blocked(&self) -> Result<Option<Vec<IpAddr>>, EnforcementError> {
        let config = self.config.clone();
        blocking(move || {
            let ruleset = get_current_ruleset().map_err(|e| classify(None, e))?;
            Ok(Some(set_elements(&ruleset, &config)))
        })
        .await
    }
}
