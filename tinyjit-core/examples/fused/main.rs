use tinyjit_core::{Graph, JitConfig, Result};
use tracing_subscriber::EnvFilter;

const ROWS: usize = 10;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tinyjit_core=info")),
        )
        .init();

    let graph = Graph::empty();
    let a = graph.add_input("A");
    let b = graph.add_input("B");
    let t1 = (&a + &b)?;
    let t2 = (&t1 * &a)?;
    let t3 = b.relu()?;
    let out = (&t2 + &t3)?;

    println!("{}", graph.dump());

    let plan = graph.compile()?;
    for node in graph.nodes().iter() {
        println!(
            "{:<28} slot {} offset {}",
            node.label(),
            plan.slot(node.id())?,
            plan.offset(node.id())?
        );
    }
    println!("arena: {} floats", plan.arena_size());

    let cfg = JitConfig::from_env()?;
    let source = graph.generate_kernel(&out)?;
    println!("{}", source.code());

    let result = graph.run(&out, &[(&a, 2.0), (&b, 3.0)], ROWS, &cfg)?;
    println!("Result: {}", result.scalar());
    assert_eq!(result.rows(), &[13.0; ROWS]);
    Ok(())
}
