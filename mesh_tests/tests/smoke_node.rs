use mesh_shared::sim::InputState;
use mesh_tests::{dead_address, start_node};

/// Smoke test: a lone node can run a few frames without panicking.
#[tokio::test]
async fn node_runs_few_frames() -> anyhow::Result<()> {
    let node = start_node("smoke", &dead_address().await?).await?;
    let fire = InputState {
        dx: 1.0,
        dy: 0.0,
        fire: true,
    };

    assert!(node.frame(fire).await.is_empty());
    assert_eq!(node.store().projectiles().len(), 1);
    for _ in 0..3 {
        node.frame(InputState::default()).await;
    }
    node.leave().await;
    Ok(())
}
