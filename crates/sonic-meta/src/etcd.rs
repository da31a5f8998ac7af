use std::sync::Arc;

use anyhow::Result;
use etcd_client::{Client, Compare, CompareOp, GetOptions, Txn, TxnOp, TxnOpResponse};
use tokio::sync::Mutex;

use crate::types::{CreateOutcome, MetaStore};

#[derive(Clone)]
pub struct EtcdMetaStore {
    client: Arc<Mutex<Client>>,
}

impl EtcdMetaStore {
    pub async fn connect(endpoints: &[String]) -> Result<Self> {
        let c = Client::connect(endpoints, None).await?;
        Ok(Self {
            client: Arc::new(Mutex::new(c)),
        })
    }
}

#[async_trait::async_trait]
impl MetaStore for EtcdMetaStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.put(key, value, None).await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(rev as u64)
    }

    async fn get(&self, key: &str) -> Result<Option<(Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(key, None).await?;
        Ok(resp
            .kvs()
            .first()
            .map(|kv| (kv.value().to_vec(), kv.mod_revision() as u64)))
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let mut cli = self.client.lock().await;
        let resp = cli.delete(key, None).await?;
        let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
        Ok(rev as u64)
    }

    async fn list_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>, u64)>> {
        let mut cli = self.client.lock().await;
        let resp = cli.get(prefix, Some(GetOptions::new().with_prefix())).await?;
        Ok(resp
            .kvs()
            .iter()
            .map(|kv| {
                (
                    String::from_utf8_lossy(kv.key()).to_string(),
                    kv.value().to_vec(),
                    kv.mod_revision() as u64,
                )
            })
            .collect())
    }

    async fn create(&self, key: &str, value: Vec<u8>) -> Result<CreateOutcome> {
        let mut cli = self.client.lock().await;

        // create_revision == 0 only holds for keys that do not exist
        let cmp = Compare::create_revision(key, CompareOp::Equal, 0);
        let txn = Txn::new()
            .when([cmp])
            .and_then([TxnOp::put(key, value, None)])
            .or_else([TxnOp::get(key, None)]);
        let resp = cli.txn(txn).await?;

        if resp.succeeded() {
            let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
            return Ok(CreateOutcome::Created(rev as u64));
        }

        for op in resp.op_responses() {
            if let TxnOpResponse::Get(get) = op {
                if let Some(kv) = get.kvs().first() {
                    return Ok(CreateOutcome::Exists {
                        value: kv.value().to_vec(),
                        revision: kv.mod_revision() as u64,
                    });
                }
            }
        }
        anyhow::bail!("create of {key} lost the race but no existing value was returned")
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected_revision: u64,
        value: Vec<u8>,
    ) -> Result<(bool, u64)> {
        let mut cli = self.client.lock().await;

        let cmp = Compare::mod_revision(key, CompareOp::Equal, expected_revision as i64);
        let txn = Txn::new()
            .when([cmp])
            .and_then([TxnOp::put(key, value, None)])
            .or_else([]);
        let resp = cli.txn(txn).await?;

        if resp.succeeded() {
            let rev = resp.header().map(|h| h.revision()).unwrap_or_default();
            return Ok((true, rev as u64));
        }

        let current = cli.get(key, None).await?;
        let current_rev = current
            .kvs()
            .first()
            .map(|kv| kv.mod_revision() as u64)
            .unwrap_or(0);
        Ok((false, current_rev))
    }
}
