//! Test secondary datacenters: intermediates signed by the primary,
//! following primary rotations, migration and upgrades.

use std::str::FromStr;
use std::time::Duration;

use meshca::api::ca::{CaConfiguration, KeyType};
use meshca::commons::crypto;
use meshca::commons::version::BuildVersion;
use meshca::constants::PROVIDER_BUILTIN;
use meshca::server::{CaState, SecondaryState};
use meshca::store::CaStore;

mod common;

use common::{
    primary_config, secondary_config, verify_leaf, wait_for, TestCluster,
};


//------------ Initialization ------------------------------------------------

#[tokio::test]
async fn secondary_gets_intermediate_from_primary() {
    let cluster = TestCluster::new();
    let dc1 = cluster.server(primary_config("dc1"));
    dc1.leader.establish_leadership().await;
    let primary_root = dc1.active_root().await;

    // The secondary may well use another key type than the primary
    let mut config = secondary_config("dc2", "dc1");
    config.ca = CaConfiguration::new(PROVIDER_BUILTIN, "")
        .with_option("PrivateKeyType", "rsa")
        .with_option("PrivateKeyBits", 2048);
    let dc2 = cluster.server(config);
    dc2.leader.establish_leadership().await;

    assert_eq!(dc2.manager.state(), CaState::Active);
    assert_eq!(dc2.manager.secondary_state(), Some(SecondaryState::Active));

    let roots = dc2.roots().await;
    assert_eq!(roots.trust_domain, dc1.roots().await.trust_domain);
    let root = roots.active_root().unwrap().clone();
    assert_eq!(root.id, primary_root.id);
    assert_eq!(root.root_cert, primary_root.root_cert);
    assert_eq!(root.intermediate_certs.len(), 1);

    let intermediate = &root.intermediate_certs[0];
    assert_eq!(root.signing_key_id, crypto::signing_key_id_of(intermediate).unwrap());
    let cert = crypto::parse_certificate(intermediate).unwrap();
    assert_eq!(
        crypto::key_type_and_bits(&cert.public_key().unwrap()).unwrap(),
        (KeyType::Rsa, 2048)
    );

    let leaf = dc2.sign_leaf("web").await.unwrap();
    verify_leaf(&leaf, &root);
    crypto::verify_chain(&leaf, &root.intermediate_certs, &primary_root.root_cert)
        .unwrap();

    // Only the primary signs intermediates
    assert!(dc2.manager.sign_intermediate_for_secondary("csr").await.is_err());

    dc2.leader.revoke_leadership().await;
    dc1.leader.revoke_leadership().await;
}

#[tokio::test]
async fn secondary_initialize_fixes_signing_key_id() {
    let cluster = TestCluster::new();
    let dc1 = cluster.server(primary_config("dc1"));
    dc1.manager.initialize().await.unwrap();
    let dc2 = cluster.server(secondary_config("dc2", "dc1"));
    dc2.manager.initialize().await.unwrap();
    let before = dc2.active_root().await;

    dc2.corrupt_signing_key_id().await;
    dc2.manager.stop();
    dc2.manager.initialize().await.unwrap();

    // The intermediate is reused, only its key ID is corrected
    let after = dc2.active_root().await;
    assert_eq!(after.intermediate_certs, before.intermediate_certs);
    assert_eq!(after.signing_key_id, before.signing_key_id);
    assert_eq!(
        dc2.manager.ca_provider().unwrap().root.signing_key_id,
        before.signing_key_id
    );
}


//------------ Renewal -------------------------------------------------------

#[tokio::test]
async fn secondary_renewal_keeps_previous_intermediate() {
    let cluster = TestCluster::new();
    let dc1 = cluster.server(primary_config("dc1"));
    dc1.manager.initialize().await.unwrap();

    // No intermediate outlives a leaf this long, so it is always renewed
    let mut config = secondary_config("dc2", "dc1");
    config.policy.min_leaf_cert_ttl = Duration::from_secs(100_000 * 3600);
    let dc2 = cluster.server(config);
    dc2.manager.initialize().await.unwrap();
    let before = dc2.active_root().await;
    let old_leaf = dc2.sign_leaf("web").await.unwrap();

    // The builtin primary signs with its root directly
    assert!(!dc1.manager.renew_intermediate_if_needed().await.unwrap());
    assert!(dc2.manager.renew_intermediate_if_needed().await.unwrap());
    assert_eq!(dc2.manager.state(), CaState::Active);

    let after = dc2.active_root().await;
    assert_eq!(after.id, before.id);
    assert_eq!(dc2.roots().await.roots.len(), 1);
    assert_eq!(after.intermediate_certs.len(), 2);
    assert_eq!(after.intermediate_certs[0], before.intermediate_certs[0]);
    assert_ne!(after.intermediate_certs[1], before.intermediate_certs[0]);
    assert_eq!(
        after.signing_key_id,
        crypto::signing_key_id_of(&after.intermediate_certs[1]).unwrap()
    );
    assert_eq!(
        dc2.manager.ca_provider().unwrap().root.signing_key_id,
        after.signing_key_id
    );

    // Leaves from before the renewal keep verifying
    crypto::verify_chain(&old_leaf, &after.intermediate_certs[..1], &after.root_cert)
        .unwrap();
    let new_leaf = dc2.sign_leaf("web").await.unwrap();
    crypto::verify_chain(&new_leaf, &after.intermediate_certs[1..], &after.root_cert)
        .unwrap();
}


//------------ Following the primary -----------------------------------------

#[tokio::test]
async fn secondary_follows_primary_rotation() {
    let cluster = TestCluster::new();
    let dc1 = cluster.server(primary_config("dc1"));
    dc1.leader.establish_leadership().await;
    let dc2 = cluster.server(secondary_config("dc2", "dc1"));
    dc2.leader.establish_leadership().await;
    let old_root = dc2.active_root().await;

    dc1.rotate_to("rsa").await;
    let new_root_id = dc1.active_root().await.id;
    assert_ne!(new_root_id, old_root.id);

    let store = dc2.store.clone();
    let expected = new_root_id.clone();
    wait_for("secondary to adopt the new root", || {
        let store = store.clone();
        let expected = expected.clone();
        async move {
            store.active_root().await.unwrap().map(|r| r.id) == Some(expected)
        }
    })
    .await;

    let roots = dc2.roots().await;
    assert_eq!(roots.roots.len(), 2);
    let root = roots.active_root().unwrap().clone();
    assert_ne!(
        root.intermediate_certs.last(),
        old_root.intermediate_certs.last()
    );

    let manager = dc2.manager.clone();
    let expected = new_root_id.clone();
    wait_for("secondary to sign with the new intermediate", || {
        let manager = manager.clone();
        let expected = expected.clone();
        async move {
            manager.ca_provider().map(|a| a.root.id == expected).unwrap_or(false)
        }
    })
    .await;

    let leaf = dc2.sign_leaf("web").await.unwrap();
    verify_leaf(&leaf, &root);

    dc2.leader.revoke_leadership().await;
    dc1.leader.revoke_leadership().await;
}

#[tokio::test]
async fn secondary_migrates_into_primary_trust_domain() {
    let cluster = TestCluster::new();
    let dc1 = cluster.server(primary_config("dc1"));
    dc1.leader.establish_leadership().await;

    // dc2 starts out as a cluster of its own
    let standalone = cluster.server(primary_config("dc2"));
    standalone.leader.establish_leadership().await;
    let own_root = standalone.active_root().await;
    let own_leaf = standalone.sign_leaf("web").await.unwrap();
    let own_cluster_id = standalone.ca_config().await.cluster_id;
    standalone.leader.revoke_leadership().await;

    // and then joins dc1
    let dc2 = cluster.server_with_store(
        secondary_config("dc2", "dc1"),
        standalone.store.clone(),
    );
    dc2.leader.establish_leadership().await;
    assert_eq!(dc2.manager.state(), CaState::Active);

    let primary_cluster_id = dc1.ca_config().await.cluster_id;
    assert_ne!(primary_cluster_id, own_cluster_id);
    assert_eq!(dc2.ca_config().await.cluster_id, primary_cluster_id);

    let roots = dc2.roots().await;
    assert_eq!(roots.trust_domain, dc1.roots().await.trust_domain);
    assert_eq!(roots.active_root_id, dc1.active_root().await.id);

    let previous = roots.roots.iter().find(|r| r.id == own_root.id).unwrap();
    assert!(!previous.active);
    assert_eq!(previous.external_trust_domain.as_deref(), Some(own_cluster_id.as_str()));
    assert_eq!(roots.roots.len(), 2);

    // Leaves issued before the migration keep verifying
    verify_leaf(&own_leaf, previous);

    let leaf = dc2.sign_leaf("web").await.unwrap();
    verify_leaf(&leaf, roots.active_root().unwrap());

    dc2.leader.revoke_leadership().await;
    dc1.leader.revoke_leadership().await;
}


//------------ Upgrades ------------------------------------------------------

#[tokio::test]
async fn secondary_waits_for_primary_upgrade() {
    let cluster = TestCluster::new();
    let mut config = primary_config("dc1");
    config.build = BuildVersion::from_str("1.3.0").unwrap();
    let dc1 = cluster.server(config);
    dc1.leader.establish_leadership().await;
    assert_eq!(dc1.manager.state(), CaState::Active);

    let dc2 = cluster.server(secondary_config("dc2", "dc1"));
    dc2.leader.establish_leadership().await;
    assert!(dc2.leader.is_leader());
    assert_eq!(dc2.manager.state(), CaState::Uninitialized);
    assert_eq!(
        dc2.manager.secondary_state(),
        Some(SecondaryState::WaitForPrimaryVersionCompatible)
    );
    assert!(dc2.roots().await.roots.is_empty());

    cluster
        .membership
        .set_build(&dc1.config.node_name, "1.6.0")
        .unwrap();

    let manager = dc2.manager.clone();
    wait_for("secondary to initialize after the upgrade", || {
        let manager = manager.clone();
        async move { manager.state() == CaState::Active }
    })
    .await;
    assert_eq!(dc2.active_root().await.id, dc1.active_root().await.id);

    dc2.leader.revoke_leadership().await;
    dc1.leader.revoke_leadership().await;
}
