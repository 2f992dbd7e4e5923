use std::time::Duration;

use refetch::{FetchConfig, FetchController, FetchError, HttpTransport};
use serde_json::Value;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let transport = HttpTransport::from_env()?;

    let config = FetchConfig::<Value>::new("posts/1")
        .with_transformer(|mut post| {
            let title = post["title"]
                .as_str()
                .ok_or_else(|| FetchError::transform("post has no title"))?
                .to_uppercase();
            post["title"] = Value::String(title);
            Ok(post)
        })
        .with_on_success(|post| println!("success: {post}"))
        .with_on_error(|err| eprintln!("error: {err}"))
        .with_retry(2, Duration::from_secs(2))
        .with_poll_interval(Duration::from_secs(10));

    let controller = FetchController::new(config, transport)?;
    let mut updates = controller.subscribe();

    for _ in 0..6 {
        updates.changed().await?;
        let state = updates.borrow_and_update().clone();
        if state.loading {
            println!("loading...");
        } else if let Some(post) = &state.data {
            println!("{} ({:?})", post["title"], state.status);
        } else if let Some(err) = &state.error {
            println!("failed: {err}");
        }
    }

    controller.dispose();
    Ok(())
}
