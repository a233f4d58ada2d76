use dfilter::*;

fn main() -> Result<(), DfilterError> {
    // 1. Describe the fields a dissector can produce
    let registry = FieldRegistryBuilder::new()
        .field("ip.addr", FieldType::Ipv4)
        .field("tcp.port", FieldType::UInt16)
        .field("http.host", FieldType::String)
        .build();

    // 2. Load macros and build the engine
    let macros = MacroTable::parse_file("\"local\",\"ip.addr == 10.0.0.$1\"\n")?;
    let engine = FilterEngine::builder(registry).macros(macros).build();

    // 3. Compile a filter
    let filter = engine.compile(r#"${local:5} && tcp.port in {80 443} && http.host contains "example""#)?;
    println!("Expanded: {}", filter.expanded_text());
    if let Some(tree) = filter.syntax_tree() {
        println!("Syntax tree:\n{}", tree);
    }
    println!("{}", filter.dump());

    // 4. Build a packet, priming only the fields the filter reads
    let mut packet = ProtoTree::primed(filter.interesting_fields());
    packet.add_parsed(engine.registry(), "ip.addr", "10.0.0.5")?;
    packet.add_parsed(engine.registry(), "tcp.port", "443")?;
    packet.add_parsed(engine.registry(), "http.host", "www.example.com")?;

    // 5. Evaluate
    println!("Filter matches: {}", filter.evaluate(&packet));
    for warning in filter.warnings() {
        println!("Warning: {}", warning);
    }
    Ok(())
}
