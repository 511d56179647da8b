// The Lambda `provided` runtimes look for an executable named `bootstrap`.

#[tokio::main]
async fn main() -> Result<(), lambda_runtime::Error> {
    waf_teardown_reconciler::run().await
}
