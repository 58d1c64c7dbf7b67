//! Criterion benchmarks for the evaluator.
//!
//! Expressions are compiled once outside the timed loop, so the numbers
//! measure evaluation only: frame setup, the walk over the canonical AST
//! and the native calls it makes.
//!
//! Run:
//!   cargo bench
//!   cargo bench -- paths        # one group
//!   cargo bench -- tail_call    # one group

use criterion::measurement::WallTime;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkGroup, BenchmarkId, Criterion};
use indexmap::IndexMap;
use jsonata_engine::{compile, Expression, JValue};

// ── Data builders ─────────────────────────────────────────────────────────────

/// Flat array of f64 values: [0.0, 1.0, ..., (n-1).0].
fn numeric_array(n: usize) -> JValue {
    let values: Vec<JValue> = (0..n).map(|i| JValue::from(i as f64)).collect();
    let mut root = IndexMap::new();
    root.insert("values".to_string(), JValue::array(values));
    JValue::object(root)
}

/// `n` catalogue entries: {id, name, category, price, inStock, tags, vendor}.
fn catalogue(n: usize) -> JValue {
    let categories = ["Electronics", "Clothing", "Books", "Home"];
    let products: Vec<JValue> = (0..n)
        .map(|i| {
            let tags: Vec<JValue> = (0..i % 5)
                .map(|j| JValue::string(format!("tag{j}")))
                .collect();

            let mut vendor = IndexMap::new();
            vendor.insert(
                "name".to_string(),
                JValue::string(format!("Vendor {}", i % 10)),
            );

            let mut p = IndexMap::new();
            p.insert("id".to_string(), JValue::from(i as f64));
            p.insert("name".to_string(), JValue::string(format!("Product {i}")));
            p.insert("category".to_string(), JValue::string(categories[i % 4]));
            p.insert("price".to_string(), JValue::from(10.0 + i as f64 * 5.5));
            p.insert("inStock".to_string(), JValue::Bool(i % 3 != 0));
            p.insert("tags".to_string(), JValue::array(tags));
            p.insert("vendor".to_string(), JValue::object(vendor));
            JValue::object(p)
        })
        .collect();

    let mut root = IndexMap::new();
    root.insert("products".to_string(), JValue::array(products));
    JValue::object(root)
}

// ── Helper: evaluate expression on data ───────────────────────────────────────

#[inline]
fn eval(expr: &Expression, data: &JValue) -> Option<JValue> {
    expr.evaluate(data).unwrap()
}

fn bench_expression(group: &mut BenchmarkGroup<'_, WallTime>, name: &str, source: &str, data: &JValue) {
    let expr = compile(source).unwrap();
    group.bench_function(name, |b| {
        b.iter(|| black_box(eval(black_box(&expr), black_box(data))))
    });
}

// ── Bench groups ──────────────────────────────────────────────────────────────

fn bench_paths(c: &mut Criterion) {
    let mut group = c.benchmark_group("paths");
    group.sample_size(300);

    let data = JValue::from_json_str(r#"{"name":"Alice","age":30}"#).unwrap();
    bench_expression(&mut group, "simple_path", "name", &data);

    let data = JValue::from_json_str(
        r#"{"a":{"b":{"c":{"d":{"e":{"f":{"g":{"h":{"i":{"j":{"k":{"l":42}}}}}}}}}}}}"#,
    )
    .unwrap();
    bench_expression(&mut group, "deep_path_12", "a.b.c.d.e.f.g.h.i.j.k.l", &data);

    let products = catalogue(100);
    bench_expression(&mut group, "flatten_100", "products.tags", &products);
    bench_expression(&mut group, "nested_field_100", "products.vendor.name", &products);
    bench_expression(&mut group, "descendants_100", "**.name", &products);

    group.finish();
}

fn bench_predicates(c: &mut Criterion) {
    let mut group = c.benchmark_group("predicates");
    let products = catalogue(100);

    bench_expression(&mut group, "index", "products[42].name", &products);
    bench_expression(&mut group, "negative_index", "products[-1].name", &products);
    bench_expression(&mut group, "filter_100", "products[price > 200].name", &products);
    bench_expression(
        &mut group,
        "compound_filter_100",
        "products[inStock and category = 'Books'].id",
        &products,
    );

    group.finish();
}

fn bench_grouping(c: &mut Criterion) {
    let mut group = c.benchmark_group("grouping");
    let products = catalogue(100);

    bench_expression(&mut group, "group_by_category", "products{category: name}", &products);
    bench_expression(
        &mut group,
        "group_aggregate",
        "products{category: $sum(price)}",
        &products,
    );
    bench_expression(
        &mut group,
        "object_per_item",
        "products.{'id': id, 'label': name & ' (' & category & ')'}",
        &products,
    );

    group.finish();
}

fn bench_sorting(c: &mut Criterion) {
    let mut group = c.benchmark_group("sorting");

    for n in [100_usize, 1000] {
        let products = catalogue(n);
        let by_price = compile("products^(>price).id").unwrap();
        group.bench_with_input(BenchmarkId::new("order_by_desc", n), &products, |b, data| {
            b.iter(|| black_box(eval(&by_price, black_box(data))))
        });

        let two_keys = compile("products^(category, >price).id").unwrap();
        group.bench_with_input(BenchmarkId::new("order_by_two_keys", n), &products, |b, data| {
            b.iter(|| black_box(eval(&two_keys, black_box(data))))
        });

        let data = numeric_array(n);
        let natural = compile("$sort($reverse(values))").unwrap();
        group.bench_with_input(BenchmarkId::new("sort_numbers", n), &data, |b, data| {
            b.iter(|| black_box(eval(&natural, black_box(data))))
        });
    }

    group.finish();
}

fn bench_higher_order_functions(c: &mut Criterion) {
    let mut group = c.benchmark_group("higher_order");

    for n in [100_usize, 1000] {
        let data = numeric_array(n);
        for (name, source) in [
            ("map", "$map(values, function($v) { $v * 2 })"),
            ("filter", "$filter(values, function($v) { $v % 2 = 0 })"),
            ("reduce", "$reduce(values, function($acc, $v) { $acc + $v }, 0)"),
            ("sort_comparator", "$sort(values, function($a, $b) { $a < $b })"),
        ] {
            let expr = compile(source).unwrap();
            group.bench_with_input(BenchmarkId::new(name, n), &data, |b, data| {
                b.iter(|| black_box(eval(&expr, black_box(data))))
            });
        }
    }

    group.finish();
}

fn bench_tail_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("tail_call");
    group.sample_size(20);

    for n in [1_000_usize, 100_000] {
        let source = format!(
            "($loop := function($n, $acc) {{ $n = 0 ? $acc : $loop($n - 1, $acc + $n) }}; $loop({n}, 0))"
        );
        let expr = compile(&source).unwrap();
        group.bench_with_input(BenchmarkId::new("countdown", n), &JValue::Null, |b, data| {
            b.iter(|| black_box(eval(&expr, black_box(data))))
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_paths,
    bench_predicates,
    bench_grouping,
    bench_sorting,
    bench_higher_order_functions,
    bench_tail_calls,
);
criterion_main!(benches);
