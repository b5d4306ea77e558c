//! 后台定时任务
//!
//! 目前只有对账任务，修复 webhook 丢失、失败或乱序留下的记录。启动时调用一次 `spawn_all`。

use std::time::Duration;

use crate::services::ReconciliationService;

/// 启动所有后台任务
///
/// 任务通过 `tokio::spawn` 脱离运行；某一轮失败只记日志，按原间隔继续下一轮
pub fn spawn_all(reconciliation_service: ReconciliationService, interval: Duration) {
    tokio::spawn(async move {
        loop {
            match reconciliation_service.run_once().await {
                Ok(report) if report.examined > 0 => log::info!(
                    "Reconciliation run: examined={} updated={} unchanged={} failed={}",
                    report.examined,
                    report.updated,
                    report.unchanged,
                    report.failed
                ),
                Ok(_) => log::debug!("Reconciliation run: nothing to examine"),
                Err(e) => log::error!("Reconciliation run failed: {e:?}"),
            }
            tokio::time::sleep(interval).await;
        }
    });
}
