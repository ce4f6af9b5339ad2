use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use neo4rs::{BoltMap, BoltNull, BoltString, BoltType, Graph, Query, Txn};
use tokio::time::{Instant, timeout_at};
use serde_json::Value;

use crate::store::{GraphStore, Row, Statement, StoreError};

const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5);

/// The transaction operations a write batch needs
#[async_trait]
pub trait Transaction: Send + Sized {
    async fn run(&mut self, statement: Statement) -> Result<(), StoreError>;
    async fn commit(self) -> Result<(), StoreError>;
    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
impl Transaction for Txn {
    async fn run(&mut self, statement: Statement) -> Result<(), StoreError> {
        Txn::run(self, to_query(statement)).await.map_err(classify)
    }

    async fn commit(self) -> Result<(), StoreError> {
        Txn::commit(self).await.map_err(classify)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Txn::rollback(self).await.map_err(classify)
    }
}

/// Run every statement of `batch` in `txn` and commit, all before `deadline`.
/// A failed statement or an expired deadline rolls the transaction back.
pub async fn write_batch<T: Transaction>(
    mut txn: T,
    batch: Vec<Statement>,
    deadline: Instant,
    timeout: Duration,
) -> Result<(), StoreError> {
    let statements = timeout_at(deadline, async {
        for statement in batch {
            txn.run(statement).await?;
        }
        Ok::<(), StoreError>(())
    })
    .await;

    let err = match statements {
        Ok(Ok(())) => {
            return timeout_at(deadline, txn.commit())
                .await
                .map_err(|_| StoreError::Timeout(timeout))?;
        }
        Ok(Err(err)) => err,
        Err(_) => StoreError::Timeout(timeout),
    };

    match tokio::time::timeout(ROLLBACK_TIMEOUT, txn.rollback()).await {
        Ok(Ok(())) => {}
        Ok(Err(rollback)) => tracing::warn!(error = %rollback, "Rollback failed"),
        Err(_) => tracing::warn!("Rollback did not finish in time"),
    }
    Err(err)
}

/// Graph store backed by a Neo4j server over Bolt
pub struct Neo4jStore {
    graph: Graph,
}

impl Neo4jStore {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }

    pub async fn connect(uri: &str, user: &str, password: &str) -> Result<Self, StoreError> {
        let graph = Graph::new(uri, user, password)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        Ok(Self::new(graph))
    }

    async fn read(&self, statement: Statement, row_limit: usize) -> Result<Vec<Row>, StoreError> {
        let mut stream = self.graph.execute(to_query(statement)).await.map_err(classify)?;
        let mut rows = Vec::new();

        // Stop pulling once the cap is reached; the rest of the stream is discarded
        while rows.len() < row_limit {
            match stream.next().await.map_err(classify)? {
                Some(row) => {
                    let row: Row = row.to().map_err(|e| StoreError::Other(e.to_string()))?;
                    rows.push(row);
                }
                None => break,
            }
        }

        Ok(rows)
    }
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn run_write(&self, batch: Vec<Statement>, timeout: Duration) -> Result<(), StoreError> {
        let deadline = Instant::now() + timeout;
        let txn = timeout_at(deadline, self.graph.start_txn())
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
            .map_err(classify)?;

        write_batch(txn, batch, deadline, timeout).await
    }

    async fn run_read(
        &self,
        statement: Statement,
        row_limit: usize,
        timeout: Duration,
    ) -> Result<Vec<Row>, StoreError> {
        tokio::time::timeout(timeout, self.read(statement, row_limit))
            .await
            .map_err(|_| StoreError::Timeout(timeout))?
    }

    fn name(&self) -> &str {
        "neo4j"
    }
}

fn to_query(statement: Statement) -> Query {
    statement
        .params
        .into_iter()
        .fold(Query::new(statement.text), |query, (key, value)| {
            query.param(&key, to_bolt(value))
        })
}

fn to_bolt(value: Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => b.into(),
        Value::Number(n) => match n.as_i64() {
            Some(i) => i.into(),
            None => n.as_f64().unwrap_or_default().into(),
        },
        Value::String(s) => s.into(),
        Value::Array(items) => items.into_iter().map(to_bolt).collect::<Vec<BoltType>>().into(),
        Value::Object(map) => BoltType::Map(BoltMap {
            value: map
                .into_iter()
                .map(|(k, v)| (BoltString::from(k), to_bolt(v)))
                .collect::<HashMap<BoltString, BoltType>>(),
        }),
    }
}

/// Neo4j reports statement problems with `Neo.ClientError.Statement.*` codes
fn classify(err: neo4rs::Error) -> StoreError {
    let message = err.to_string();
    let lower = message.to_lowercase();

    if message.contains("Neo.ClientError.Statement") || message.contains("SyntaxError") {
        StoreError::Syntax(message)
    } else if lower.contains("connection") || lower.contains("io error") || lower.contains("broken pipe") {
        StoreError::Connection(message)
    } else {
        StoreError::Other(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingTxn {
        delay: Duration,
        fail_on: Option<usize>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingTxn {
        fn new(delay: Duration, fail_on: Option<usize>) -> (Self, Arc<Mutex<Vec<String>>>) {
            let log = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    delay,
                    fail_on,
                    log: log.clone(),
                },
                log,
            )
        }
    }

    #[async_trait]
    impl Transaction for RecordingTxn {
        async fn run(&mut self, statement: Statement) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            let n = self.log.lock().len();
            if self.fail_on == Some(n) {
                return Err(StoreError::Syntax("bad statement".to_string()));
            }
            self.log.lock().push(statement.text);
            Ok(())
        }

        async fn commit(self) -> Result<(), StoreError> {
            self.log.lock().push("commit".to_string());
            Ok(())
        }

        async fn rollback(self) -> Result<(), StoreError> {
            self.log.lock().push("rollback".to_string());
            Ok(())
        }
    }

    fn batch() -> Vec<Statement> {
        vec![Statement::new("CREATE (a)"), Statement::new("CREATE (b)")]
    }

    #[tokio::test]
    async fn test_batch_commits() {
        let (txn, log) = RecordingTxn::new(Duration::ZERO, None);
        let timeout = Duration::from_secs(5);

        write_batch(txn, batch(), Instant::now() + timeout, timeout).await.unwrap();
        assert_eq!(*log.lock(), vec!["CREATE (a)", "CREATE (b)", "commit"]);
    }

    #[tokio::test]
    async fn test_failed_statement_rolls_back() {
        let (txn, log) = RecordingTxn::new(Duration::ZERO, Some(1));
        let timeout = Duration::from_secs(5);

        let err = write_batch(txn, batch(), Instant::now() + timeout, timeout).await.unwrap_err();
        assert!(err.is_syntax());
        assert_eq!(*log.lock(), vec!["CREATE (a)", "rollback"]);
    }

    #[tokio::test]
    async fn test_timeout_rolls_back() {
        let (txn, log) = RecordingTxn::new(Duration::from_millis(500), None);
        let timeout = Duration::from_millis(20);

        let err = write_batch(txn, batch(), Instant::now() + timeout, timeout).await.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(d) if d == timeout));
        assert_eq!(*log.lock(), vec!["rollback"]);
    }
}
