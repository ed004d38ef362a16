use std::sync::Arc;
use std::time::Duration;

use appstore_core::AppDeployment;
use appstore_engine::{EngineError, Next, Reconciler};
use futures::{FutureExt, StreamExt};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub struct Ctx {
    pub engine: Reconciler,
}

fn action(next: Next) -> Action {
    match next {
        Next::RequeueNow => Action::requeue(Duration::from_millis(100)),
        Next::RequeueAfter(d) => Action::requeue(d),
        Next::AwaitChange => Action::await_change(),
    }
}

async fn reconcile(record: Arc<AppDeployment>, ctx: Arc<Ctx>) -> Result<Action, EngineError> {
    ctx.engine.reconcile(&record).await.map(action)
}

fn error_policy(record: Arc<AppDeployment>, err: &EngineError, ctx: Arc<Ctx>) -> Action {
    warn!(name = %record.name_any(), ns = %record.namespace_or_default(), error = %err, "reconcile error");
    Action::requeue(ctx.engine.config().failure_interval)
}

/// Watch every `AppDeployment` in the cluster until `token` is cancelled.
/// In-flight reconciles finish before this returns.
pub async fn run(client: Client, engine: Reconciler, token: CancellationToken) {
    let api: Api<AppDeployment> = Api::all(client);
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        token.cancelled().await;
        let _ = stop_tx.send(());
    });

    Controller::new(api, watcher::Config::default())
        .graceful_shutdown_on(stop_rx.map(|_| ()))
        .run(reconcile, error_policy, Arc::new(Ctx { engine }))
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => debug!(name = %obj.name, ns = ?obj.namespace, ?action, "reconciled"),
                Err(e) => warn!(error = %e, "controller error"),
            }
        })
        .await;
}
