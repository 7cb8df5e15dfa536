use std::collections::HashMap;
use std::io::{Read, Write};

use csv::{ReaderBuilder, Trim, WriterBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::AppResult;
use crate::model::{CoordinateRecord, DistrictName};

/// Total incident count of one district in the report year.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistrictDemand {
    pub name: DistrictName,
    pub weight: u64,
}

/// A resolved district joined with its weight, ready for the heat map.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MapPoint {
    pub departamento_nombre: String,
    pub cantidad_hechos: u64,
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Deserialize)]
struct IncidentRow {
    provincia_nombre: String,
    departamento_nombre: String,
    anio: i32,
    #[serde(default)]
    cantidad_hechos: Option<u64>,
}

/// Reads the semicolon-delimited SNIC dataset and sums incidents per district
/// for the latest year of `province`. Lines that do not parse are skipped.
pub fn read_demand<R: Read>(reader: R, province: &str) -> AppResult<Vec<DistrictDemand>> {
    let mut csv = ReaderBuilder::new()
        .delimiter(b';')
        .flexible(true)
        .trim(Trim::All)
        .from_reader(reader);

    let mut rows = Vec::new();
    let mut skipped = 0_usize;
    for row in csv.deserialize::<IncidentRow>() {
        match row {
            Ok(row) if row.provincia_nombre == province => rows.push(row),
            Ok(_) => {}
            Err(err) => {
                skipped += 1;
                debug!(?err, "skipping malformed dataset line");
            }
        }
    }

    let Some(latest_year) = rows.iter().map(|row| row.anio).max() else {
        info!(province, skipped, "no dataset rows for province");
        return Ok(Vec::new());
    };

    let mut order: Vec<DistrictDemand> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for row in rows.into_iter().filter(|row| row.anio == latest_year) {
        let Ok(name) = DistrictName::new(row.departamento_nombre) else {
            skipped += 1;
            continue;
        };
        let weight = row.cantidad_hechos.unwrap_or(0);
        match index.get(name.as_str()) {
            Some(&slot) => order[slot].weight += weight,
            None => {
                index.insert(name.as_str().to_string(), order.len());
                order.push(DistrictDemand { name, weight });
            }
        }
    }

    info!(
        province,
        year = latest_year,
        districts = order.len(),
        skipped,
        "district demand loaded"
    );
    Ok(order)
}

/// Inner join of demand and resolved records, in demand order.
pub fn join_map_points(demand: &[DistrictDemand], records: &[CoordinateRecord]) -> Vec<MapPoint> {
    let by_name: HashMap<&str, &CoordinateRecord> = records
        .iter()
        .map(|record| (record.name.as_str(), record))
        .collect();
    demand
        .iter()
        .filter_map(|entry| {
            by_name.get(entry.name.as_str()).map(|record| MapPoint {
                departamento_nombre: entry.name.to_string(),
                cantidad_hechos: entry.weight,
                lat: record.coordinate.lat(),
                lon: record.coordinate.lon(),
            })
        })
        .collect()
}

pub fn write_map_points_csv<W: Write>(writer: W, points: &[MapPoint]) -> AppResult<()> {
    let mut csv = WriterBuilder::new().from_writer(writer);
    for point in points {
        csv.serialize(point)?;
    }
    csv.flush()?;
    Ok(())
}

pub fn write_map_points_json<W: Write>(mut writer: W, points: &[MapPoint]) -> AppResult<()> {
    serde_json::to_writer_pretty(&mut writer, points)?;
    writeln!(writer)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Coordinate;

    const SAMPLE: &str = "\
provincia_id;provincia_nombre;departamento_id;departamento_nombre;anio;codigo_delito_snic_nombre;cantidad_hechos
6;Buenos Aires;6441;La Plata;2022;Robos;120
6;Buenos Aires;6028;Almirante Brown;2023;Robos;80
6;Buenos Aires;6441;La Plata;2023;Hurtos;50
this line is broken
6;Buenos Aires;6441;La Plata;2023;Robos;70
14;Córdoba;14014;Capital;2023;Robos;300
6;Buenos Aires;6028;Almirante Brown;2023;Hurtos;
6;Buenos Aires;6056;Bahía Blanca;2023;Robos;not-a-number
";

    #[test]
    fn sums_latest_year_in_first_appearance_order() {
        let demand = read_demand(SAMPLE.as_bytes(), "Buenos Aires").unwrap();
        let summary: Vec<(&str, u64)> = demand
            .iter()
            .map(|d| (d.name.as_str(), d.weight))
            .collect();
        assert_eq!(summary, vec![("Almirante Brown", 80), ("La Plata", 120)]);
    }

    #[test]
    fn unknown_province_yields_no_demand() {
        assert!(read_demand(SAMPLE.as_bytes(), "Mendoza").unwrap().is_empty());
    }

    #[test]
    fn joins_only_resolved_districts() {
        let demand = read_demand(SAMPLE.as_bytes(), "Buenos Aires").unwrap();
        let records = vec![CoordinateRecord::cached(
            DistrictName::new("La Plata").unwrap(),
            Coordinate::new(-34.92, -57.95).unwrap(),
        )];
        let points = join_map_points(&demand, &records);
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].departamento_nombre, "La Plata");
        assert_eq!(points[0].cantidad_hechos, 120);

        let mut out = Vec::new();
        write_map_points_csv(&mut out, &points).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("departamento_nombre,cantidad_hechos,lat,lon\n"));
        assert!(text.contains("La Plata,120,-34.92,-57.95"));
    }
}
